//! `mfsd` serves an ext2 filesystem image to TCP clients.
//!
//! One worker thread per connection; every worker shares the single
//! filesystem instance behind one process-wide mutex. A background thread
//! flushes the block cache every 10 seconds.

use mfs::cache::Cache;
use mfs::disk::Disk;
use mfs::ext2::Ext2;
use mfs::fatal;
use mfs::layout::DEFAULT_DISK_SIZE;
use mfs::prompt::prompt;
use mfs::proto::recv_frame;
use mfs::proto::send_frame;
use mfs::proto::COMMAND_LEN;
use mfs::proto::MSG_LEN;
use mfs::shell::Shell;
use mfs::user;
use mfs::user::UserList;
use mfs::util;
use mfs::util::ByteSize;
use mfs::vfs::Vfs;
use std::env;
use std::io;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// The default TCP port.
const DEFAULT_PORT: u16 = 60000;
/// The default path of the disk image.
const DEFAULT_DISK_PATH: &str = "disk.img";
/// The default block cache capacity, in blocks.
const DEFAULT_CACHE_CAPACITY: usize = 1024;
/// The interval between two background cache flushes, in seconds.
const SYNC_INTERVAL: u64 = 10;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,

	/// The TCP port to listen on.
	port: Option<u16>,
	/// The path to the disk image.
	disk_path: Option<PathBuf>,
	/// The size of the disk image in bytes, when creating it.
	disk_size: Option<u64>,
	/// The path to the user file.
	users_path: Option<PathBuf>,
	/// The block cache capacity.
	cache_capacity: Option<usize>,

	/// A user name to append to the user file instead of serving.
	useradd: Option<String>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();
	args.prog = iter.next().unwrap_or("mfsd".to_owned());

	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-p" | "--port" => {
				args.port = Some(
					iter.next()
						.and_then(|val| val.parse().ok())
						.unwrap_or_else(|| fatal(&args.prog, "invalid port")),
				)
			}
			"-d" | "--disk" => {
				args.disk_path = Some(
					iter.next()
						.map(PathBuf::from)
						.unwrap_or_else(|| fatal(&args.prog, "missing disk path")),
				)
			}
			"-s" | "--size" => {
				args.disk_size = Some(
					iter.next()
						.and_then(|val| val.parse().ok())
						.unwrap_or_else(|| fatal(&args.prog, "invalid disk size")),
				)
			}
			"-u" | "--users" => {
				args.users_path = Some(
					iter.next()
						.map(PathBuf::from)
						.unwrap_or_else(|| fatal(&args.prog, "missing user file path")),
				)
			}
			"-c" | "--cache" => {
				args.cache_capacity = Some(
					iter.next()
						.and_then(|val| val.parse().ok())
						.filter(|cap| *cap > 0)
						.unwrap_or_else(|| fatal(&args.prog, "invalid cache capacity")),
				)
			}
			"--useradd" => {
				args.useradd = Some(
					iter.next()
						.unwrap_or_else(|| fatal(&args.prog, "missing user name")),
				)
			}
			_ => fatal(&args.prog, format_args!("invalid option `{arg}`")),
		}
	}
	args
}

/// Prints command help.
fn print_help(prog: &str) {
	println!();
	println!("Usage:");
	println!(" {prog} [options]");
	println!();
	println!("Serves an ext2 filesystem image over TCP.");
	println!();
	println!("Options:");
	println!(" -h, --help\t\tPrints help.");
	println!(" -p, --port <port>\tListens on the given port (default {DEFAULT_PORT}).");
	println!(" -d, --disk <path>\tUses the given disk image (default {DEFAULT_DISK_PATH}).");
	println!(" -s, --size <bytes>\tSize of a newly created image (default {DEFAULT_DISK_SIZE}).");
	println!(" -u, --users <path>\tUses the given user file (default {}).", user::DEFAULT_USERLIST_PATH);
	println!(" -c, --cache <blocks>\tBlock cache capacity (default {DEFAULT_CACHE_CAPACITY}).");
	println!(" --useradd <name>\tAppends a user to the user file, then exits.");
}

/// Writes a timestamped line to stdout.
fn log(msg: &str) {
	let now = util::get_timestamp().as_secs() as u32;
	println!("[{}]: {msg}", util::format_timestamp(now));
}

/// Serves one connection: login handshake, then command dispatch.
fn handle_connection(
	mut stream: TcpStream,
	vfs: Arc<Mutex<Vfs>>,
	users_path: Arc<PathBuf>,
) -> io::Result<()> {
	log("New connection accepted");

	let users = match UserList::read(&users_path) {
		Ok(users) => users,
		Err(e) => {
			log(&format!("cannot read {}: {e}", users_path.display()));
			return Ok(());
		}
	};

	// the first accepted command must be a successful login
	loop {
		let Some(line) = recv_frame(&mut stream, COMMAND_LEN)? else {
			return Ok(());
		};
		log(&line);
		let tokens: Vec<&str> = line.split_whitespace().collect();
		if tokens.len() != 3 || tokens[0] != "login" {
			send_frame(&mut stream, "Please login first!", MSG_LEN)?;
			continue;
		}
		match users.login(tokens[1], tokens[2]) {
			Some(_) => {
				log(&format!("{} login success", tokens[1]));
				send_frame(&mut stream, "login_success", MSG_LEN)?;
				break;
			}
			None => send_frame(&mut stream, "Login failed!", MSG_LEN)?,
		}
	}

	let mut shell = Shell::new(vfs);
	loop {
		let Some(line) = recv_frame(&mut stream, COMMAND_LEN)? else {
			log("Connection closed");
			return Ok(());
		};
		log(&line);
		let cmd = line.split_whitespace().next().unwrap_or("");
		if cmd == "exit" || cmd == "logout" {
			log("Server end close a socket");
			return Ok(());
		}
		if let Some(reply) = shell.execute(&line) {
			send_frame(&mut stream, &reply, MSG_LEN)?;
		}
	}
}

fn main() {
	let args = parse_args();
	if args.help {
		print_help(&args.prog);
		return;
	}

	let users_path = args
		.users_path
		.unwrap_or_else(|| PathBuf::from(user::DEFAULT_USERLIST_PATH));

	// maintenance mode: append a user, then exit
	if let Some(name) = args.useradd {
		let Some(pass) = prompt("Password: ", true) else {
			exit(1);
		};
		user::add_user(&users_path, &name, &pass)
			.unwrap_or_else(|e| fatal(&args.prog, format_args!("{name}: {e}")));
		println!("user `{name}` added to {}", users_path.display());
		return;
	}

	let port = args.port.unwrap_or(DEFAULT_PORT);
	let disk_path = args
		.disk_path
		.unwrap_or_else(|| PathBuf::from(DEFAULT_DISK_PATH));
	let disk_size = args.disk_size.unwrap_or(DEFAULT_DISK_SIZE);
	let cache_capacity = args.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);

	let disk = Disk::open(&disk_path, disk_size).unwrap_or_else(|e| {
		fatal(&args.prog, format_args!("{}: {e}", disk_path.display()))
	});
	let fs = Ext2::open(Cache::new(disk, cache_capacity))
		.unwrap_or_else(|e| fatal(&args.prog, e));
	let vfs = Arc::new(Mutex::new(Vfs::new(fs)));
	let users_path = Arc::new(users_path);

	log(&format!(
		"Serving {} ({}) on port {port}",
		disk_path.display(),
		ByteSize(disk_size)
	));

	// periodic flush of the block cache, under the lock
	{
		let vfs = Arc::clone(&vfs);
		thread::spawn(move || loop {
			thread::sleep(Duration::from_secs(SYNC_INTERVAL));
			if let Err(e) = vfs.lock().unwrap().sync() {
				eprintln!("sync: {e}");
			}
		});
	}

	let listener = TcpListener::bind(("0.0.0.0", port)).unwrap_or_else(|e| {
		fatal(&args.prog, format_args!("cannot listen on port {port}: {e}"))
	});
	for stream in listener.incoming() {
		match stream {
			Ok(stream) => {
				let vfs = Arc::clone(&vfs);
				let users_path = Arc::clone(&users_path);
				thread::spawn(move || {
					if let Err(e) = handle_connection(stream, vfs, users_path) {
						log(&format!("connection error: {e}"));
					}
				});
			}
			Err(e) => log(&format!("accept failed: {e}")),
		}
	}
}
