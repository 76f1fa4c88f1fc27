//! The command shell translating textual commands to filesystem calls.
//!
//! Each connection owns one shell, holding its working directory. All
//! filesystem state is shared behind one mutex, taken across each
//! individual call.

use crate::error::Error;
use crate::util;
use crate::vfs::Vfs;
use std::sync::Arc;
use std::sync::Mutex;

/// The maximum number of content bytes `cat` reads, so the reply always
/// fits one frame.
const CAT_MAX: usize = crate::proto::MSG_LEN - 1;

/// The reply to `help`.
const HELP_MESSAGE: &str = "Command:
pwd:                    Show working directory
cd(chdir) <dir>:        Switch current working directory
ls(dir) [dir]:          Display the contents of the directory
cat(read) <file>:       Print the file's content
mkdir <dir>:            Create directory
rm(remove) <file>:      Delete a file
touch(create) <file>:   Create a new file
write <content> <file> [offset]: Write to the file at the given offset
rmdir <dir>:            Delete an empty directory
mv(rename) <src> <dst>: Rename or move a file or directory
help(h):                Show this message
exit(logout):           Close the session
";

/// A per-connection shell session.
pub struct Shell {
	vfs: Arc<Mutex<Vfs>>,
	/// The working directory.
	cwd: String,
}

impl Shell {
	pub fn new(vfs: Arc<Mutex<Vfs>>) -> Self {
		Self {
			vfs,
			cwd: String::from("/"),
		}
	}

	/// Returns the working directory.
	pub fn pwd(&self) -> &str {
		&self.cwd
	}

	/// Resolves `path` against the working directory.
	fn to_abs(&self, path: &str) -> String {
		if path.is_empty() {
			return self.cwd.clone();
		}
		if path.starts_with('/') {
			return path.to_owned();
		}
		if self.cwd.ends_with('/') {
			format!("{}{}", self.cwd, path)
		} else {
			format!("{}/{}", self.cwd, path)
		}
	}

	/// Executes one command line.
	///
	/// Returns the reply to send, or `None` for an empty line.
	pub fn execute(&mut self, line: &str) -> Option<String> {
		let tokens: Vec<&str> = line.split_whitespace().collect();
		let cmd = *tokens.first()?;
		let reply = match cmd {
			"pwd" => self.cwd.clone(),
			"cd" | "chdir" => {
				if tokens.len() != 2 {
					String::from("Usage: cd <dir>")
				} else {
					self.cd(tokens[1])
				}
			}
			"ls" | "dir" => self.ls(tokens.get(1).copied().unwrap_or("")),
			"cat" | "read" => match tokens.get(1) {
				Some(path) => self.cat(path),
				None => String::from("cat: missing operand"),
			},
			"mkdir" => match tokens.get(1) {
				Some(path) => self.mkdir(path),
				None => String::from("mkdir: missing operand"),
			},
			"rm" | "remove" => match tokens.get(1) {
				Some(path) => self.rm(path),
				None => String::from("rm: missing operand"),
			},
			"touch" | "create" => match tokens.get(1) {
				Some(path) => self.touch(path),
				None => String::from("touch: missing operand"),
			},
			"write" => {
				if tokens.len() < 3 {
					String::from("write: missing operand")
				} else {
					let offset = tokens
						.get(3)
						.and_then(|s| s.parse::<u32>().ok())
						.unwrap_or(0);
					self.write(tokens[1], tokens[2], offset)
				}
			}
			"rmdir" => match tokens.get(1) {
				Some(path) => self.rmdir(path),
				None => String::from("rmdir: missing operand"),
			},
			"mv" | "rename" => {
				if tokens.len() < 3 {
					String::from("mv: missing operand")
				} else {
					self.mv(tokens[1], tokens[2])
				}
			}
			"help" | "h" => String::from(HELP_MESSAGE),
			_ => String::from("Unknown command!"),
		};
		Some(reply)
	}

	fn cd(&mut self, dir: &str) -> String {
		let abs = self.to_abs(dir);
		let mut vfs = self.vfs.lock().unwrap();
		match vfs.exists(&abs) {
			Ok(crate::ext2::FileType::Directory) => {}
			Ok(_) => return format!("cd: {dir}: Not a directory"),
			Err(e) => return format!("cd: {dir}: {e}"),
		}
		match vfs.real_path(&abs) {
			Ok(real) => {
				self.cwd = real;
				format!("cd {dir}: OK")
			}
			Err(e) => format!("cd: {dir}: {e}"),
		}
	}

	fn ls(&self, dir: &str) -> String {
		let abs = self.to_abs(dir);
		let entries = match self.vfs.lock().unwrap().list_dir(&abs) {
			Ok(entries) => entries,
			Err(e) => return format!("ls: {dir}: {e}"),
		};

		let mut out = format!("{abs}:\n");
		out += &format!(
			"{:<10} {:<10} {:>20} {:>10} {:>15}\n",
			"ino", "type", "ctime", "size", "name"
		);
		out += &"-".repeat(72);
		out.push('\n');
		for (name, stat) in entries {
			let file_type = match crate::ext2::FileType::from_mode(stat.mode) {
				Some(crate::ext2::FileType::Directory) => "dir",
				Some(crate::ext2::FileType::Regular) => "file",
				None => "unknown",
			};
			out += &format!(
				"{:<10} {:<10} {:>20} {:>10} {:>15}\n",
				stat.inode,
				file_type,
				util::format_timestamp(stat.ctime),
				stat.size,
				name
			);
		}
		out
	}

	fn cat(&self, path: &str) -> String {
		let abs = self.to_abs(path);
		let mut vfs = self.vfs.lock().unwrap();
		let fd = match vfs.open(&abs, libc::O_RDONLY) {
			Ok(fd) => fd,
			Err(e) => return format!("cat: {path}: {e}"),
		};
		let mut buf = vec![0u8; CAT_MAX];
		let res = vfs.read(fd, &mut buf);
		let _ = vfs.close(fd);
		match res {
			Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
			Err(e) => format!("cat: {path}: {e}"),
		}
	}

	fn touch(&self, path: &str) -> String {
		let abs = self.to_abs(path);
		match self.vfs.lock().unwrap().create(&abs) {
			Ok(()) => format!("touch: {path}: OK"),
			Err(e) => format!("touch: {path}: {e}"),
		}
	}

	fn write(&self, content: &str, path: &str, offset: u32) -> String {
		let abs = self.to_abs(path);
		let mut vfs = self.vfs.lock().unwrap();
		let fd = match vfs.open(&abs, libc::O_WRONLY) {
			Ok(fd) => fd,
			Err(e) => return format!("write: {path}: {e}"),
		};
		let res = match vfs.lseek(fd, offset as i64, libc::SEEK_SET) {
			Ok(_) => vfs.write(fd, content.as_bytes()),
			Err(e) => Err(e),
		};
		let _ = vfs.close(fd);
		match res {
			Ok(_) => format!("write: {path}: OK"),
			Err(e) => format!("write: {path}: {e}"),
		}
	}

	fn rm(&self, path: &str) -> String {
		let abs = self.to_abs(path);
		match self.vfs.lock().unwrap().unlink(&abs) {
			Ok(()) => format!("rm: {path}: OK"),
			Err(e) => format!("rm: {path}: {e}"),
		}
	}

	fn mkdir(&self, path: &str) -> String {
		let abs = self.to_abs(path);
		match self.vfs.lock().unwrap().mkdir(&abs) {
			Ok(()) => format!("mkdir: {path}: OK"),
			Err(e) => format!("mkdir: {path}: {e}"),
		}
	}

	fn rmdir(&self, path: &str) -> String {
		let abs = self.to_abs(path);
		match self.vfs.lock().unwrap().rmdir(&abs) {
			Ok(()) => format!("rmdir: {path}: OK"),
			Err(e) => format!("rmdir: {path}: {e}"),
		}
	}

	fn mv(&self, src: &str, dst: &str) -> String {
		let abs_src = self.to_abs(src);
		let abs_dst = self.to_abs(dst);
		match self.vfs.lock().unwrap().mv(&abs_src, &abs_dst) {
			Ok(()) => format!("mv {src} {dst}: OK"),
			Err(e) => format!("mv: {src}: {e}"),
		}
	}
}

impl Drop for Shell {
	fn drop(&mut self) {
		if let Err(Error::Io(e)) = self.vfs.lock().unwrap().sync() {
			eprintln!("shell: sync on close failed: {e}");
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cache::Cache;
	use crate::disk::Disk;
	use crate::ext2::Ext2;
	use std::env;
	use std::fs;
	use std::path::PathBuf;

	fn temp_path(name: &str) -> PathBuf {
		env::temp_dir().join(format!("mfs-shell-{}-{}", std::process::id(), name))
	}

	fn open_shell(path: &PathBuf) -> Shell {
		let disk = Disk::open(path, 16 * 1024 * 1024).unwrap();
		let fs = Ext2::open(Cache::new(disk, 32)).unwrap();
		Shell::new(Arc::new(Mutex::new(Vfs::new(fs))))
	}

	#[test]
	fn session() {
		let path = temp_path("session.img");
		let _ = fs::remove_file(&path);
		let mut shell = open_shell(&path);

		assert_eq!(shell.execute("mkdir /home").unwrap(), "mkdir: /home: OK");
		assert_eq!(shell.execute("cd home").unwrap(), "cd home: OK");
		assert_eq!(shell.execute("pwd").unwrap(), "/home");

		// relative paths resolve against the working directory
		assert_eq!(shell.execute("touch notes.txt").unwrap(), "touch: notes.txt: OK");
		assert_eq!(
			shell.execute("write hello notes.txt").unwrap(),
			"write: notes.txt: OK"
		);
		assert_eq!(shell.execute("cat notes.txt").unwrap(), "hello");

		// write at an offset overwrites in place
		assert_eq!(
			shell.execute("write HELP notes.txt 1").unwrap(),
			"write: notes.txt: OK"
		);
		assert_eq!(shell.execute("cat /home/notes.txt").unwrap(), "hHELP");

		let ls = shell.execute("ls").unwrap();
		assert!(ls.contains("notes.txt"));
		assert!(ls.contains("file"));

		assert_eq!(
			shell.execute("mv notes.txt final.txt").unwrap(),
			"mv notes.txt final.txt: OK"
		);
		assert_eq!(shell.execute("rm final.txt").unwrap(), "rm: final.txt: OK");
		assert_eq!(shell.execute("cd ..").unwrap(), "cd ..: OK");
		assert_eq!(shell.execute("pwd").unwrap(), "/");
		assert_eq!(shell.execute("rmdir home").unwrap(), "rmdir: home: OK");

		drop(shell);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn error_rendering() {
		let path = temp_path("errors.img");
		let _ = fs::remove_file(&path);
		let mut shell = open_shell(&path);

		assert_eq!(
			shell.execute("cd nope").unwrap(),
			"cd: nope: No such file or directory"
		);
		assert_eq!(
			shell.execute("cat /nope").unwrap(),
			"cat: /nope: No such file or directory"
		);
		let _ = shell.execute("touch f");
		assert_eq!(shell.execute("cd f").unwrap(), "cd: f: Not a directory");
		assert_eq!(shell.execute("touch f").unwrap(), "touch: f: File exists");
		assert_eq!(shell.execute("frobnicate").unwrap(), "Unknown command!");
		assert_eq!(shell.execute("cd"), Some(String::from("Usage: cd <dir>")));
		assert_eq!(shell.execute(""), None);
		assert!(shell.execute("help").unwrap().contains("pwd"));

		drop(shell);
		fs::remove_file(&path).unwrap();
	}
}
