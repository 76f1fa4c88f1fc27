//! POSIX-shaped file and directory operations over the filesystem engine.
//!
//! All paths crossing this boundary are absolute; the shell converts
//! relative paths beforehand. The open-file table lives here: descriptors
//! are small integers, slots 0..2 are reserved for the standard streams.

use crate::error::Error;
use crate::error::Result;
use crate::ext2::dirent;
use crate::ext2::inode::SECTORS_PER_BLOCK;
use crate::ext2::Ext2;
use crate::ext2::FileType;
use crate::ext2::ROOT_INODE;
use crate::layout::BLOCK_SIZE;
use crate::util;

/// Portable file status.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
	/// The inode number.
	pub inode: u32,
	/// Type and permission bits.
	pub mode: u16,
	/// Size in bytes.
	pub size: u32,
	/// The number of hard links.
	pub links_count: u16,
	/// Owner user ID.
	pub uid: u16,
	/// Owner group ID.
	pub gid: u16,
	/// Timestamp of the last access.
	pub atime: u32,
	/// Timestamp of the last content change.
	pub mtime: u32,
	/// Timestamp of the last metadata change.
	pub ctime: u32,
}

/// An open file description.
#[derive(Clone, Copy)]
struct FileDesc {
	/// The inode number, 0 when the slot is free.
	inode: u32,
	/// The byte offset.
	offset: u64,
	/// The open flags.
	flags: i32,
}

/// A free open-file slot.
const FREE_DESC: FileDesc = FileDesc {
	inode: 0,
	offset: 0,
	flags: 0,
};

/// The number of descriptors reserved for the standard streams.
const RESERVED_FDS: usize = 3;

/// Tells whether the open flags allow reading.
fn readable(flags: i32) -> bool {
	let acc = flags & libc::O_ACCMODE;
	acc == libc::O_RDONLY || acc == libc::O_RDWR
}

/// Tells whether the open flags allow writing.
fn writable(flags: i32) -> bool {
	let acc = flags & libc::O_ACCMODE;
	acc == libc::O_WRONLY || acc == libc::O_RDWR
}

/// Splits a path into its non-empty components.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|comp| !comp.is_empty())
}

/// The virtual filesystem layer.
pub struct Vfs {
	fs: Ext2,
	/// The open-file table.
	files: Vec<FileDesc>,
}

impl Vfs {
	/// Creates the layer over the engine `fs`.
	pub fn new(fs: Ext2) -> Self {
		Self {
			fs,
			files: vec![FREE_DESC; RESERVED_FDS],
		}
	}

	/// Synchronizes cached writes to the backing device.
	pub fn sync(&mut self) -> Result<()> {
		self.fs.sync()
	}

	/// Returns the engine, for inspection.
	pub fn fs(&self) -> &Ext2 {
		&self.fs
	}

	/// Looks the name `name` up in the directory inode `dir`.
	fn lookup(&mut self, dir: u32, name: &str) -> Result<Option<u32>> {
		let inode = self.fs.read_inode(dir)?;
		if !inode.is_directory() {
			return Err(Error::NotDirectory);
		}
		let mut buf = [0u8; BLOCK_SIZE as usize];
		for blk in inode.collect_blocks(&mut self.fs)? {
			self.fs.read_block(blk, &mut buf)?;
			if let Some(n) = dirent::lookup(&buf, name) {
				return Ok(Some(n));
			}
		}
		Ok(None)
	}

	/// Resolves an absolute path to its inode.
	fn resolve(&mut self, path: &str) -> Result<u32> {
		let mut cur = ROOT_INODE;
		for comp in split_path(path) {
			cur = self.lookup(cur, comp)?.ok_or(Error::NotFound)?;
		}
		Ok(cur)
	}

	/// Resolves all but the last component of `path`.
	///
	/// Returns the parent directory's inode and the leaf name.
	fn resolve_parent<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str)> {
		let comps: Vec<&str> = split_path(path).collect();
		let Some((&leaf, dirs)) = comps.split_last() else {
			return Err(Error::Invalid);
		};
		let mut cur = ROOT_INODE;
		for comp in dirs {
			cur = self.lookup(cur, comp)?.ok_or(Error::NotFound)?;
		}
		Ok((cur, leaf))
	}

	/// Returns the parent of the directory inode `dir` through its '..'
	/// entry.
	fn parent_of(&mut self, dir: u32) -> Result<u32> {
		match self.lookup(dir, "..")? {
			Some(parent) => Ok(parent),
			None => panic!("directory inode {dir} has no '..' entry"),
		}
	}

	/// Inserts the entry `name` -> `target` into the directory inode `dir`.
	///
	/// The first data block with enough room takes the record; when all are
	/// packed a new block is appended, initialized as a single free record.
	fn add_entry(&mut self, dir: u32, name: &str, target: u32, file_type: FileType) -> Result<()> {
		let mut dir_inode = self.fs.read_inode(dir)?;
		let timestamp = util::get_timestamp().as_secs() as u32;
		let mut buf = [0u8; BLOCK_SIZE as usize];
		for blk in dir_inode.collect_blocks(&mut self.fs)? {
			self.fs.read_block(blk, &mut buf)?;
			if dirent::insert(&mut buf, target, file_type, name) {
				self.fs.write_block(blk, &buf)?;
				dir_inode.mtime = timestamp;
				return self.fs.write_inode(dir, &dir_inode);
			}
		}
		// every block is packed: append one
		let off = dir_inode.size / BLOCK_SIZE;
		let group = self.fs.group_of_inode(dir);
		let blk = dir_inode.alloc_blk(&mut self.fs, off, group)?;
		dirent::init_empty_block(&mut buf);
		let inserted = dirent::insert(&mut buf, target, file_type, name);
		assert!(inserted);
		self.fs.write_block(blk, &buf)?;
		dir_inode.size += BLOCK_SIZE;
		dir_inode.mtime = timestamp;
		self.fs.write_inode(dir, &dir_inode)
	}

	/// Removes the entry pointing at `target` from the directory inode
	/// `dir`.
	fn remove_entry(&mut self, dir: u32, target: u32) -> Result<()> {
		let mut dir_inode = self.fs.read_inode(dir)?;
		let mut buf = [0u8; BLOCK_SIZE as usize];
		for blk in dir_inode.collect_blocks(&mut self.fs)? {
			self.fs.read_block(blk, &mut buf)?;
			if dirent::remove(&mut buf, target) {
				self.fs.write_block(blk, &buf)?;
				dir_inode.mtime = util::get_timestamp().as_secs() as u32;
				return self.fs.write_inode(dir, &dir_inode);
			}
		}
		panic!("no entry for inode {target} in directory inode {dir}");
	}

	/// Creates a directory named `name` under the directory inode `parent`.
	///
	/// On allocation failure everything created by the call is released.
	fn create_directory(&mut self, parent: u32, name: &str) -> Result<u32> {
		if name.is_empty() || name.len() > dirent::NAME_MAX {
			return Err(Error::Invalid);
		}
		let (n, mut inode) = self.fs.create_inode(FileType::Directory, 0o755, 0, 0)?;
		let group = self.fs.group_of_inode(n);
		let blk = match self.fs.balloc(group) {
			Ok(blk) => blk,
			Err(e) => {
				self.fs.ifree(n)?;
				return Err(e);
			}
		};
		let mut buf = [0u8; BLOCK_SIZE as usize];
		dirent::init_first_block(&mut buf, n, parent);
		self.fs.write_block(blk, &buf)?;
		inode.block_ptrs[0] = blk;
		inode.size = BLOCK_SIZE;
		inode.used_sectors = SECTORS_PER_BLOCK;
		self.fs.write_inode(n, &inode)?;

		if let Err(e) = self.add_entry(parent, name, n, FileType::Directory) {
			self.fs.ifree(n)?;
			return Err(e);
		}
		Ok(n)
	}

	/// Creates the directory at `path`, along with its missing parents.
	///
	/// Existing intermediate components are walked into; the final component
	/// must not exist yet.
	pub fn mkdir(&mut self, path: &str) -> Result<()> {
		let comps: Vec<&str> = split_path(path).collect();
		let Some((&leaf, dirs)) = comps.split_last() else {
			return Err(Error::Exists);
		};
		let mut cur = ROOT_INODE;
		for &comp in dirs {
			cur = match self.lookup(cur, comp)? {
				Some(n) => n,
				None => self.create_directory(cur, comp)?,
			};
		}
		if self.lookup(cur, leaf)?.is_some() {
			return Err(Error::Exists);
		}
		self.create_directory(cur, leaf)?;
		Ok(())
	}

	/// Creates an empty regular file at `path`.
	///
	/// Every intermediate component must exist.
	pub fn create(&mut self, path: &str) -> Result<()> {
		let (parent, leaf) = self.resolve_parent(path)?;
		if leaf.len() > dirent::NAME_MAX {
			return Err(Error::Invalid);
		}
		if self.lookup(parent, leaf)?.is_some() {
			return Err(Error::Exists);
		}
		let (n, _) = self.fs.create_inode(FileType::Regular, 0o644, 0, 0)?;
		if let Err(e) = self.add_entry(parent, leaf, n, FileType::Regular) {
			self.fs.ifree(n)?;
			return Err(e);
		}
		Ok(())
	}

	/// Removes the regular file at `path` and frees its inode.
	pub fn unlink(&mut self, path: &str) -> Result<()> {
		let (parent, leaf) = self.resolve_parent(path)?;
		let n = self.lookup(parent, leaf)?.ok_or(Error::NotFound)?;
		let inode = self.fs.read_inode(n)?;
		if !inode.is_regular() {
			return Err(Error::NotDirectory);
		}
		self.remove_entry(parent, n)?;
		self.fs.ifree(n)
	}

	/// Removes the directory at `path`, which must only hold '.' and '..'.
	pub fn rmdir(&mut self, path: &str) -> Result<()> {
		let (parent, leaf) = self.resolve_parent(path)?;
		if leaf == "." || leaf == ".." {
			return Err(Error::Invalid);
		}
		let n = self.lookup(parent, leaf)?.ok_or(Error::NotFound)?;
		if n == ROOT_INODE {
			return Err(Error::Invalid);
		}
		let inode = self.fs.read_inode(n)?;
		if !inode.is_directory() {
			return Err(Error::NotDirectory);
		}
		let mut buf = [0u8; BLOCK_SIZE as usize];
		for blk in inode.collect_blocks(&mut self.fs)? {
			self.fs.read_block(blk, &mut buf)?;
			for entry in dirent::list(&buf) {
				if entry.name != "." && entry.name != ".." {
					return Err(Error::NotEmpty);
				}
			}
		}
		self.remove_entry(parent, n)?;
		self.fs.ifree(n)
	}

	/// Moves the file or directory at `old_path` to `new_path`.
	///
	/// The entry keeps its inode; only the links change. Moving a directory
	/// into its own subtree is rejected.
	pub fn mv(&mut self, old_path: &str, new_path: &str) -> Result<()> {
		let (src_parent, src_leaf) = self.resolve_parent(old_path)?;
		if src_leaf == "." || src_leaf == ".." {
			return Err(Error::Invalid);
		}
		let src = self.lookup(src_parent, src_leaf)?.ok_or(Error::NotFound)?;
		if src == ROOT_INODE {
			return Err(Error::Invalid);
		}
		let (dst_parent, dst_leaf) = self.resolve_parent(new_path)?;
		if dst_leaf == "." || dst_leaf == ".." || dst_leaf.len() > dirent::NAME_MAX {
			return Err(Error::Invalid);
		}
		if self.lookup(dst_parent, dst_leaf)?.is_some() {
			return Err(Error::Exists);
		}

		let inode = self.fs.read_inode(src)?;
		let file_type = inode.file_type().ok_or(Error::Invalid)?;
		if file_type == FileType::Directory {
			// walk the destination's parent chain: meeting the source would
			// detach a cycle
			let mut p = dst_parent;
			loop {
				if p == src {
					return Err(Error::Invalid);
				}
				if p == ROOT_INODE {
					break;
				}
				p = self.parent_of(p)?;
			}
		}

		self.remove_entry(src_parent, src)?;
		if let Err(e) = self.add_entry(dst_parent, dst_leaf, src, file_type) {
			// relink under the old name
			self.add_entry(src_parent, src_leaf, src, file_type)?;
			return Err(e);
		}
		if file_type == FileType::Directory && src_parent != dst_parent {
			self.set_parent_link(src, dst_parent)?;
		}
		Ok(())
	}

	/// Points the '..' entry of the directory inode `dir` at `parent`.
	fn set_parent_link(&mut self, dir: u32, parent: u32) -> Result<()> {
		let inode = self.fs.read_inode(dir)?;
		let ptrs = inode.block_ptrs;
		assert!(ptrs[0] != 0, "directory without a first data block");
		let mut buf = [0u8; BLOCK_SIZE as usize];
		self.fs.read_block(ptrs[0], &mut buf)?;
		let found = dirent::relink(&mut buf, "..", parent);
		assert!(found, "directory inode {dir} has no '..' entry");
		self.fs.write_block(ptrs[0], &buf)
	}

	/// Returns the descriptor of `fd`, if open.
	fn desc(&self, fd: usize) -> Result<FileDesc> {
		if fd < RESERVED_FDS || fd >= self.files.len() || self.files[fd].inode == 0 {
			return Err(Error::Invalid);
		}
		Ok(self.files[fd])
	}

	/// Opens the regular file at `path`.
	///
	/// With `O_CREAT`, the file is created first; an already existing file
	/// is opened as-is. Returns the lowest free descriptor `>= 3`.
	pub fn open(&mut self, path: &str, flags: i32) -> Result<usize> {
		let acc = flags & libc::O_ACCMODE;
		if acc != libc::O_RDONLY && acc != libc::O_WRONLY && acc != libc::O_RDWR {
			return Err(Error::Invalid);
		}
		if flags & libc::O_CREAT != 0 {
			match self.create(path) {
				Ok(()) | Err(Error::Exists) => {}
				Err(e) => return Err(e),
			}
		}
		let n = self.resolve(path)?;
		let inode = self.fs.read_inode(n)?;
		if !inode.is_regular() {
			return Err(Error::NotDirectory);
		}

		let fd = self
			.files
			.iter()
			.enumerate()
			.skip(RESERVED_FDS)
			.find(|(_, f)| f.inode == 0)
			.map(|(i, _)| i)
			.unwrap_or_else(|| {
				self.files.push(FREE_DESC);
				self.files.len() - 1
			});
		self.files[fd] = FileDesc {
			inode: n,
			offset: 0,
			flags,
		};
		Ok(fd)
	}

	/// Closes the descriptor `fd`.
	pub fn close(&mut self, fd: usize) -> Result<()> {
		self.desc(fd)?;
		self.files[fd] = FREE_DESC;
		Ok(())
	}

	/// Reads up to `buf.len()` bytes at the descriptor's offset.
	///
	/// Reading is bounded by the file size; the offset advances by the
	/// returned count.
	pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
		let d = self.desc(fd)?;
		if !readable(d.flags) {
			return Err(Error::Invalid);
		}
		if buf.is_empty() {
			return Ok(0);
		}
		let mut inode = self.fs.read_inode(d.inode)?;
		inode.atime = util::get_timestamp().as_secs() as u32;
		self.fs.write_inode(d.inode, &inode)?;

		let size = inode.size as u64;
		if d.offset >= size {
			return Ok(0);
		}
		let count = buf.len().min((size - d.offset) as usize);

		let bs = BLOCK_SIZE as u64;
		let end = d.offset + count as u64;
		let mut copied = 0usize;
		let mut pos = d.offset;
		let mut blkbuf = [0u8; BLOCK_SIZE as usize];
		while pos < end {
			let boff = (pos % bs) as usize;
			let chunk = (bs as usize - boff).min((end - pos) as usize);
			let blk = inode
				.translate_blk(&mut self.fs, (pos / bs) as u32)?
				.expect("unallocated block inside a dense file");
			self.fs.read_block(blk, &mut blkbuf)?;
			buf[copied..copied + chunk].copy_from_slice(&blkbuf[boff..boff + chunk]);
			copied += chunk;
			pos += chunk as u64;
		}

		self.files[fd].offset = end;
		Ok(count)
	}

	/// Writes `buf` at the descriptor's offset, extending the file as
	/// needed.
	///
	/// Every block up to the end of the written range is allocated first, so
	/// the file stays dense. The offset advances past the written bytes.
	pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
		let d = self.desc(fd)?;
		if !writable(d.flags) {
			return Err(Error::Invalid);
		}
		if buf.is_empty() {
			return Ok(0);
		}
		let end = d.offset + buf.len() as u64;
		if end > u32::MAX as u64 {
			return Err(Error::Invalid);
		}
		let mut inode = self.fs.read_inode(d.inode)?;

		let bs = BLOCK_SIZE as u64;
		let have = util::ceil_division(inode.size as u64, bs) as u32;
		let need = util::ceil_division(end, bs) as u32;
		let group = self.fs.group_of_inode(d.inode);
		for off in have..need {
			if let Err(e) = inode.alloc_blk(&mut self.fs, off, group) {
				// commit what was allocated so far; the structure stays
				// consistent, the size does not change
				self.fs.write_inode(d.inode, &inode)?;
				return Err(e);
			}
		}

		let mut copied = 0usize;
		let mut pos = d.offset;
		let mut blkbuf = [0u8; BLOCK_SIZE as usize];
		while pos < end {
			let boff = (pos % bs) as usize;
			let chunk = (bs as usize - boff).min((end - pos) as usize);
			let blk = inode
				.translate_blk(&mut self.fs, (pos / bs) as u32)?
				.expect("unallocated block inside a dense file");
			if chunk == bs as usize {
				self.fs.write_block(blk, &buf[copied..copied + chunk])?;
			} else {
				self.fs.read_block(blk, &mut blkbuf)?;
				blkbuf[boff..boff + chunk].copy_from_slice(&buf[copied..copied + chunk]);
				self.fs.write_block(blk, &blkbuf)?;
			}
			copied += chunk;
			pos += chunk as u64;
		}

		let timestamp = util::get_timestamp().as_secs() as u32;
		inode.size = u32::max(inode.size, end as u32);
		inode.atime = timestamp;
		inode.mtime = timestamp;
		self.fs.write_inode(d.inode, &inode)?;
		self.files[fd].offset = end;
		Ok(buf.len())
	}

	/// Repositions the offset of the descriptor `fd`.
	pub fn lseek(&mut self, fd: usize, offset: i64, whence: i32) -> Result<u64> {
		let d = self.desc(fd)?;
		let base = match whence {
			libc::SEEK_SET => 0,
			libc::SEEK_CUR => d.offset as i64,
			libc::SEEK_END => self.fs.read_inode(d.inode)?.size as i64,
			_ => return Err(Error::Invalid),
		};
		let pos = base.checked_add(offset).ok_or(Error::Invalid)?;
		if pos < 0 {
			return Err(Error::Invalid);
		}
		self.files[fd].offset = pos as u64;
		Ok(pos as u64)
	}

	/// Returns the status of the inode `n`.
	fn stat_inode(&mut self, n: u32) -> Result<FileStat> {
		let inode = self.fs.read_inode(n)?;
		Ok(FileStat {
			inode: n,
			mode: inode.mode,
			size: inode.size,
			links_count: inode.links_count,
			uid: inode.uid,
			gid: inode.gid,
			atime: inode.atime,
			mtime: inode.mtime,
			ctime: inode.ctime,
		})
	}

	/// Returns the status of the open descriptor `fd`.
	pub fn fstat(&mut self, fd: usize) -> Result<FileStat> {
		let d = self.desc(fd)?;
		self.stat_inode(d.inode)
	}

	/// Returns the status of the file at `path`.
	pub fn stat(&mut self, path: &str) -> Result<FileStat> {
		let n = self.resolve(path)?;
		self.stat_inode(n)
	}

	/// Returns the type of the file at `path`.
	pub fn exists(&mut self, path: &str) -> Result<FileType> {
		let n = self.resolve(path)?;
		let inode = self.fs.read_inode(n)?;
		inode.file_type().ok_or(Error::Invalid)
	}

	/// Returns the entries of the directory at `path` with their status.
	pub fn list_dir(&mut self, path: &str) -> Result<Vec<(String, FileStat)>> {
		let n = self.resolve(path)?;
		let inode = self.fs.read_inode(n)?;
		if !inode.is_directory() {
			return Err(Error::NotDirectory);
		}
		let mut out = Vec::new();
		let mut buf = [0u8; BLOCK_SIZE as usize];
		for blk in inode.collect_blocks(&mut self.fs)? {
			self.fs.read_block(blk, &mut buf)?;
			for entry in dirent::list(&buf) {
				let stat = self.stat_inode(entry.inode)?;
				out.push((entry.name, stat));
			}
		}
		Ok(out)
	}

	/// Collapses '.' and '..' in `path` by walking the directory tree.
	///
	/// '..' at the root stays at the root. Every named component must
	/// exist.
	pub fn real_path(&mut self, path: &str) -> Result<String> {
		let mut cur = ROOT_INODE;
		let mut stack: Vec<&str> = Vec::new();
		for comp in split_path(path) {
			match comp {
				"." => {}
				".." => {
					if cur != ROOT_INODE {
						cur = self.parent_of(cur)?;
						stack.pop();
					}
				}
				name => {
					cur = self.lookup(cur, name)?.ok_or(Error::NotFound)?;
					stack.push(name);
				}
			}
		}
		Ok(format!("/{}", stack.join("/")))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cache::Cache;
	use crate::disk::Disk;
	use std::env;
	use std::fs;
	use std::path::PathBuf;

	fn temp_path(name: &str) -> PathBuf {
		env::temp_dir().join(format!("mfs-vfs-{}-{}", std::process::id(), name))
	}

	fn open_vfs(path: &PathBuf, disk_size: u64) -> Vfs {
		let disk = Disk::open(path, disk_size).unwrap();
		let fs = Ext2::open(Cache::new(disk, 32)).unwrap();
		Vfs::new(fs)
	}

	const DISK: u64 = 16 * 1024 * 1024;

	#[test]
	fn tree_building() {
		let path = temp_path("tree.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/home").unwrap();
		vfs.mkdir("/home/u").unwrap();
		vfs.create("/home/u/a.txt").unwrap();

		let names: Vec<String> = vfs
			.list_dir("/home/u")
			.unwrap()
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		assert_eq!(names, vec![".", "..", "a.txt"]);

		let stat = vfs.stat("/home/u/a.txt").unwrap();
		assert_eq!(stat.mode, 0x8000 | 0o644);
		assert_eq!(stat.size, 0);
		assert_eq!(stat.links_count, 1);

		assert_eq!(vfs.exists("/home/u").unwrap(), FileType::Directory);
		assert_eq!(vfs.exists("/home/u/a.txt").unwrap(), FileType::Regular);
		assert!(matches!(vfs.exists("/nope"), Err(Error::NotFound)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn write_read_round_trip() {
		let path = temp_path("rw.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.create("/a.txt").unwrap();
		let fd = vfs.open("/a.txt", libc::O_RDWR).unwrap();
		assert_eq!(vfs.write(fd, b"Hello World").unwrap(), 11);
		assert_eq!(vfs.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 11);
		vfs.close(fd).unwrap();

		let fd = vfs.open("/a.txt", libc::O_RDONLY).unwrap();
		let mut buf = [0u8; 512];
		assert_eq!(vfs.read(fd, &mut buf).unwrap(), 11);
		assert_eq!(&buf[..11], b"Hello World");
		// the whole file was consumed
		assert_eq!(vfs.read(fd, &mut buf).unwrap(), 0);
		vfs.close(fd).unwrap();

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn lseek_rules() {
		let path = temp_path("lseek.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.create("/f").unwrap();
		let fd = vfs.open("/f", libc::O_RDWR).unwrap();
		vfs.write(fd, &[7u8; 100]).unwrap();

		assert_eq!(vfs.lseek(fd, 0, libc::SEEK_END).unwrap(), 100);
		assert_eq!(vfs.lseek(fd, -60, libc::SEEK_CUR).unwrap(), 40);
		assert_eq!(vfs.lseek(fd, 10, libc::SEEK_SET).unwrap(), 10);
		assert!(matches!(vfs.lseek(fd, -20, libc::SEEK_SET), Err(Error::Invalid)));
		assert!(matches!(vfs.lseek(fd, 0, 42), Err(Error::Invalid)));

		// write after an explicit seek, then read it back
		vfs.lseek(fd, 95, libc::SEEK_SET).unwrap();
		vfs.write(fd, &[9u8; 10]).unwrap();
		vfs.lseek(fd, -10, libc::SEEK_CUR).unwrap();
		let mut buf = [0u8; 10];
		assert_eq!(vfs.read(fd, &mut buf).unwrap(), 10);
		assert_eq!(buf, [9u8; 10]);

		vfs.close(fd).unwrap();
		assert!(matches!(vfs.read(fd, &mut buf), Err(Error::Invalid)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn big_file_round_trip_and_persistence() {
		let path = temp_path("big.img");
		let _ = fs::remove_file(&path);

		// a 1.5 MB pseudo-random sequence crosses into double indirection
		let mut data = vec![0u8; 1_500_000];
		let mut state = 0x2545f491_4f6cdd1du64;
		for b in data.iter_mut() {
			state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			*b = (state >> 33) as u8;
		}

		let free_before;
		{
			let mut vfs = open_vfs(&path, DISK);
			free_before = vfs.fs().free_blocks_count();
			vfs.create("/big.bin").unwrap();
			let fd = vfs.open("/big.bin", libc::O_WRONLY).unwrap();
			for chunk in data.chunks(64 * 1024) {
				vfs.write(fd, chunk).unwrap();
			}
			vfs.close(fd).unwrap();
			vfs.sync().unwrap();
		}

		// reopen from disk and compare byte by byte
		let mut vfs = open_vfs(&path, DISK);
		assert_eq!(vfs.stat("/big.bin").unwrap().size, 1_500_000);
		let fd = vfs.open("/big.bin", libc::O_RDONLY).unwrap();
		let mut back = vec![0u8; data.len()];
		let mut total = 0;
		while total < back.len() {
			let n = vfs.read(fd, &mut back[total..]).unwrap();
			assert!(n > 0);
			total += n;
		}
		assert!(back == data);
		vfs.close(fd).unwrap();

		// removing the file returns every block, pointer blocks included
		vfs.unlink("/big.bin").unwrap();
		assert_eq!(vfs.fs().free_blocks_count(), free_before);

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn block_boundary_writes() {
		let path = temp_path("boundary.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.create("/f").unwrap();
		let fd = vfs.open("/f", libc::O_RDWR).unwrap();
		vfs.write(fd, &[1u8; 1024]).unwrap();
		vfs.write(fd, &[2u8; 1024]).unwrap();
		assert_eq!(vfs.stat("/f").unwrap().size, 2048);

		// a write landing past the current end allocates the gap blocks too
		vfs.lseek(fd, 5000, libc::SEEK_SET).unwrap();
		vfs.write(fd, b"tail").unwrap();
		assert_eq!(vfs.stat("/f").unwrap().size, 5004);

		// the gap reads back as zeros
		vfs.lseek(fd, 2048, libc::SEEK_SET).unwrap();
		let mut buf = [0xffu8; 512];
		assert_eq!(vfs.read(fd, &mut buf).unwrap(), 512);
		assert_eq!(buf, [0u8; 512]);

		vfs.close(fd).unwrap();
		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn indirect_thresholds() {
		let path = temp_path("thresholds.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.create("/f").unwrap();
		let fd = vfs.open("/f", libc::O_WRONLY).unwrap();

		// 12 direct blocks, no pointer block yet
		let free = vfs.fs().free_blocks_count();
		vfs.write(fd, &vec![3u8; 12 * 1024]).unwrap();
		assert_eq!(free - vfs.fs().free_blocks_count(), 12);

		// the 13th block brings the single-indirect pointer block with it
		let free = vfs.fs().free_blocks_count();
		vfs.write(fd, &[3u8; 1024]).unwrap();
		assert_eq!(free - vfs.fs().free_blocks_count(), 2);

		vfs.close(fd).unwrap();
		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn strict_mkdir() {
		let path = temp_path("mkdir.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/a/b/c").unwrap();
		assert_eq!(vfs.exists("/a/b/c").unwrap(), FileType::Directory);
		// the same call again fails: the final component already exists
		assert!(matches!(vfs.mkdir("/a/b/c"), Err(Error::Exists)));
		// existing intermediates are fine as long as the leaf is new
		vfs.mkdir("/a/b/d").unwrap();
		assert!(matches!(vfs.mkdir("/"), Err(Error::Exists)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn mv_keeps_inode() {
		let path = temp_path("mv.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/home/u").unwrap();
		vfs.create("/home/u/a.txt").unwrap();
		let inode = vfs.stat("/home/u/a.txt").unwrap().inode;

		vfs.mv("/home/u/a.txt", "/home/u/b.txt").unwrap();
		let names: Vec<String> = vfs
			.list_dir("/home/u")
			.unwrap()
			.into_iter()
			.map(|(name, _)| name)
			.collect();
		assert!(names.contains(&"b.txt".to_string()));
		assert!(!names.contains(&"a.txt".to_string()));
		assert_eq!(vfs.stat("/home/u/b.txt").unwrap().inode, inode);

		// moving across directories updates '..' of a moved directory
		vfs.mkdir("/elsewhere").unwrap();
		vfs.mv("/home/u", "/elsewhere/u").unwrap();
		assert_eq!(vfs.exists("/elsewhere/u/b.txt").unwrap(), FileType::Regular);
		assert_eq!(vfs.real_path("/elsewhere/u/..").unwrap(), "/elsewhere");

		// destination name already taken
		vfs.create("/elsewhere/u/c.txt").unwrap();
		assert!(matches!(
			vfs.mv("/elsewhere/u/b.txt", "/elsewhere/u/c.txt"),
			Err(Error::Exists)
		));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn mv_into_own_subtree_rejected() {
		let path = temp_path("mvcycle.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/a/b").unwrap();
		assert!(matches!(vfs.mv("/a", "/a/b/c"), Err(Error::Invalid)));
		assert!(matches!(vfs.mv("/a", "/a/x"), Err(Error::Invalid)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn directory_churn() {
		let path = temp_path("churn.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/d").unwrap();
		for i in 0..300 {
			vfs.create(&format!("/d/f{i:03}")).unwrap();
		}
		assert_eq!(vfs.list_dir("/d").unwrap().len(), 302);

		for i in (0..300).step_by(2) {
			vfs.unlink(&format!("/d/f{i:03}")).unwrap();
		}
		assert_eq!(vfs.list_dir("/d").unwrap().len(), 152);

		// reclaimed space takes the new names without growing further
		for i in 0..150 {
			vfs.create(&format!("/d/g{i:03}")).unwrap();
		}
		assert_eq!(vfs.list_dir("/d").unwrap().len(), 302);

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn error_kinds() {
		let path = temp_path("errors.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/d").unwrap();
		vfs.create("/d/f").unwrap();

		assert!(matches!(vfs.unlink("/d"), Err(Error::NotDirectory)));
		assert!(matches!(vfs.open("/d", libc::O_RDONLY), Err(Error::NotDirectory)));
		assert!(matches!(vfs.rmdir("/d/f"), Err(Error::NotDirectory)));
		assert!(matches!(vfs.rmdir("/d"), Err(Error::NotEmpty)));
		assert!(matches!(vfs.unlink("/nope"), Err(Error::NotFound)));
		assert!(matches!(vfs.create("/d/f"), Err(Error::Exists)));
		assert!(matches!(vfs.create("/x/f"), Err(Error::NotFound)));
		assert!(matches!(vfs.rmdir("/"), Err(Error::Invalid)));

		vfs.unlink("/d/f").unwrap();
		vfs.rmdir("/d").unwrap();
		assert!(matches!(vfs.exists("/d"), Err(Error::NotFound)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn rmdir_returns_space() {
		let path = temp_path("rmspace.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		let free_blocks = vfs.fs().free_blocks_count();
		let free_inodes = vfs.fs().free_inodes_count();
		vfs.mkdir("/d").unwrap();
		vfs.rmdir("/d").unwrap();
		assert_eq!(vfs.fs().free_blocks_count(), free_blocks);
		assert_eq!(vfs.fs().free_inodes_count(), free_inodes);

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn real_path_normalization() {
		let path = temp_path("realpath.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.mkdir("/home/delta").unwrap();
		assert_eq!(
			vfs.real_path("/././home/../home/delta").unwrap(),
			"/home/delta"
		);
		// '..' above the root is clamped
		assert_eq!(vfs.real_path("/home/../../..").unwrap(), "/");
		assert_eq!(vfs.real_path("/").unwrap(), "/");
		assert!(matches!(vfs.real_path("/nope"), Err(Error::NotFound)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn fd_slots_reused() {
		let path = temp_path("fds.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		vfs.create("/f").unwrap();
		let a = vfs.open("/f", libc::O_RDONLY).unwrap();
		let b = vfs.open("/f", libc::O_RDONLY).unwrap();
		assert_eq!(a, 3);
		assert_eq!(b, 4);
		vfs.close(a).unwrap();
		// the lowest free slot is taken again
		assert_eq!(vfs.open("/f", libc::O_RDONLY).unwrap(), 3);

		// write on a read-only descriptor is rejected
		assert!(matches!(vfs.write(b, b"x"), Err(Error::Invalid)));

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn o_creat_opens_existing() {
		let path = temp_path("ocreat.img");
		let _ = fs::remove_file(&path);
		let mut vfs = open_vfs(&path, DISK);

		let fd = vfs.open("/new.txt", libc::O_RDWR | libc::O_CREAT).unwrap();
		vfs.write(fd, b"abc").unwrap();
		vfs.close(fd).unwrap();

		// opening an existing file with O_CREAT keeps its content
		let fd = vfs.open("/new.txt", libc::O_RDONLY | libc::O_CREAT).unwrap();
		let mut buf = [0u8; 8];
		assert_eq!(vfs.read(fd, &mut buf).unwrap(), 3);
		assert_eq!(&buf[..3], b"abc");
		vfs.close(fd).unwrap();

		drop(vfs);
		fs::remove_file(&path).unwrap();
	}
}
