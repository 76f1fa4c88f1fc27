//! The user list consulted at login.
//!
//! The store is a flat text file, one `<uid> <user> <password>` entry per
//! line. The password field holds either clear text or an argon2 hash in
//! PHC string format; verification accepts both, which lets hashed entries
//! coexist with hand-written clear ones.

use argon2::password_hash::SaltString;
use argon2::Argon2;
use argon2::PasswordHash;
use argon2::PasswordHasher;
use argon2::PasswordVerifier;
use rand_core::OsRng;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;

/// The default path of the user file.
pub const DEFAULT_USERLIST_PATH: &str = "userlist.txt";

/// Hashes the given clear password and returns it with a generated salt, in
/// PHC string format.
pub fn hash_password(pass: &str) -> Result<String, argon2::password_hash::Error> {
	let salt = SaltString::generate(&mut OsRng);
	let hash = Argon2::default().hash_password(pass.as_bytes(), &salt)?;
	Ok(hash.to_string())
}

/// Tells whether the given password `pass` corresponds to the stored
/// password field `stored`.
///
/// A field that parses as a PHC string is verified as an argon2 hash; any
/// other field is compared as clear text.
pub fn check_password(stored: &str, pass: &str) -> bool {
	if let Ok(parsed_hash) = PasswordHash::new(stored) {
		return Argon2::default()
			.verify_password(pass.as_bytes(), &parsed_hash)
			.is_ok();
	}
	stored == pass
}

/// Structure representing a user entry.
pub struct User {
	/// The user ID.
	pub uid: u32,
	/// The user's login name.
	pub name: String,
	/// The user's password field, clear or hashed.
	pub password: String,
}

/// The users list.
pub struct UserList {
	users: Vec<User>,
}

impl UserList {
	/// Reads and parses the user file at `path`.
	///
	/// Malformed lines are skipped.
	pub fn read(path: &Path) -> io::Result<Self> {
		let file = File::open(path)?;
		let users = BufReader::new(file)
			.lines()
			.collect::<io::Result<Vec<_>>>()?
			.into_iter()
			.filter_map(|line| {
				let fields: Vec<&str> = line.split_whitespace().collect();
				if fields.len() != 3 {
					return None;
				}
				Some(User {
					uid: fields[0].parse().ok()?,
					name: fields[1].to_owned(),
					password: fields[2].to_owned(),
				})
			})
			.collect();
		Ok(Self {
			users,
		})
	}

	/// Checks the given credentials.
	///
	/// Returns the user's ID on success.
	pub fn login(&self, name: &str, pass: &str) -> Option<u32> {
		let user = self.users.iter().find(|u| u.name == name)?;
		check_password(&user.password, pass).then_some(user.uid)
	}

	/// Returns the number of entries.
	pub fn len(&self) -> usize {
		self.users.len()
	}

	/// Tells whether the list is empty.
	pub fn is_empty(&self) -> bool {
		self.users.is_empty()
	}

	/// Returns the first unused user ID.
	pub fn next_uid(&self) -> u32 {
		self.users.iter().map(|u| u.uid + 1).max().unwrap_or(0)
	}
}

/// Appends a user with a hashed password to the file at `path`, creating
/// the file if needed.
pub fn add_user(path: &Path, name: &str, pass: &str) -> io::Result<()> {
	if name.is_empty() || name.contains(char::is_whitespace) {
		return Err(io::Error::new(
			io::ErrorKind::InvalidInput,
			"invalid user name",
		));
	}
	let uid = match UserList::read(path) {
		Ok(list) => list.next_uid(),
		Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
		Err(e) => return Err(e),
	};
	let hash = hash_password(pass)
		.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

	let mut file = OpenOptions::new().create(true).append(true).open(path)?;
	writeln!(file, "{uid} {name} {hash}")
}
