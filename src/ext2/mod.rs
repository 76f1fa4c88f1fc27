//! The on-disk filesystem engine.
//!
//! The engine manages the superblock and group descriptors, the inode table,
//! and the per-group allocation bitmaps. All I/O goes through the block
//! cache. The format is bit-exact ext2: little-endian packed records,
//! 1024-byte superblock at block 1, redundant superblock and GDT copies at
//! the head of every block group.

pub mod dirent;
pub mod inode;

use crate::bitmap::Bitmap;
use crate::bitmap::NO_BIT;
use crate::cache::Cache;
use crate::error::Error;
use crate::error::Result;
use crate::layout::Layout;
use crate::layout::BLOCK_SIZE;
use crate::layout::GROUP_DESC_SIZE;
use crate::layout::INODES_PER_BLOCK;
use crate::layout::INODE_SIZE;
use crate::util;
use inode::Inode;
use uuid::Uuid;

/// The filesystem's signature.
const EXT2_SIGNATURE: u16 = 0xef53;
/// Filesystem state: the filesystem is clean.
const FS_STATE_CLEAN: u16 = 1;
/// Error handle action: continue.
const ERR_ACTION_CONTINUE: u16 = 1;
/// The creator OS id of Linux.
const OS_ID_LINUX: u32 = 0;
/// The number of mounts allowed before a consistency check must be done.
const FSCK_MOUNT_COUNT: u16 = 1024;
/// The interval in seconds between mandatory consistency checks.
const FSCK_INTERVAL: u32 = 2678400;

/// The first inode available for allocation. Inodes `1..=10` are reserved.
pub const FIRST_NON_RESERVED_INODE: u32 = 11;
/// The number of reserved inodes.
const RESERVED_INODES: u32 = FIRST_NON_RESERVED_INODE - 1;
/// The inode of the root directory.
pub const ROOT_INODE: u32 = 2;

/// The signature written into the boot block at format time.
const BOOT_SIGNATURE: &[u8] = b"mfs ext2 image, block size 1KiB, boot block";
/// The volume name written into the superblock.
const VOLUME_NAME: &[u8] = b"mfs.img";

/// The type of a file, as encoded in inode mode bits and directory entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	Regular,
	Directory,
}

/// Inode mode: type mask.
const MODE_TYPE_MASK: u16 = 0xf000;
/// Inode mode: directory.
const MODE_DIRECTORY: u16 = 0x4000;
/// Inode mode: regular file.
const MODE_REGULAR: u16 = 0x8000;

/// Directory entry type indicator: regular file.
const DIRENT_TYPE_REGULAR: u8 = 1;
/// Directory entry type indicator: directory.
const DIRENT_TYPE_DIRECTORY: u8 = 2;

impl FileType {
	/// Returns the file type encoded in the mode bits, if supported.
	pub fn from_mode(mode: u16) -> Option<Self> {
		match mode & MODE_TYPE_MASK {
			MODE_REGULAR => Some(Self::Regular),
			MODE_DIRECTORY => Some(Self::Directory),
			_ => None,
		}
	}

	/// Returns the mode type bits of the file type.
	pub fn mode_bits(self) -> u16 {
		match self {
			Self::Regular => MODE_REGULAR,
			Self::Directory => MODE_DIRECTORY,
		}
	}

	/// Returns the directory-entry type indicator.
	pub(crate) fn dirent_tag(self) -> u8 {
		match self {
			Self::Regular => DIRENT_TYPE_REGULAR,
			Self::Directory => DIRENT_TYPE_DIRECTORY,
		}
	}

	/// Returns the file type for a directory-entry type indicator.
	pub(crate) fn from_dirent_tag(tag: u8) -> Option<Self> {
		match tag {
			DIRENT_TYPE_REGULAR => Some(Self::Regular),
			DIRENT_TYPE_DIRECTORY => Some(Self::Directory),
			_ => None,
		}
	}
}

/// The ext2 superblock.
///
/// Stored little-endian packed at block 1 and copied to the first block of
/// every block group.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Superblock {
	/// Total number of inodes in the filesystem.
	total_inodes: u32,
	/// Total number of blocks in the filesystem.
	total_blocks: u32,
	/// Number of blocks reserved for the superuser.
	superuser_blocks: u32,
	/// Total number of unallocated blocks.
	free_blocks_count: u32,
	/// Total number of unallocated inodes.
	free_inodes_count: u32,
	/// Index of the first data block, holding the superblock.
	first_data_block: u32,
	/// log2(block_size) - 10
	block_size_log: u32,
	/// log2(fragment_size) - 10
	fragment_size_log: u32,
	/// The number of blocks per block group.
	blocks_per_group: u32,
	/// The number of fragments per block group.
	fragments_per_group: u32,
	/// The number of inodes per block group.
	inodes_per_group: u32,
	/// The timestamp of the last mount operation.
	last_mount_timestamp: u32,
	/// The timestamp of the last write operation.
	last_write_timestamp: u32,
	/// The number of mounts since the last consistency check.
	mount_count_since_fsck: u16,
	/// The number of mounts allowed before a consistency check must be done.
	mount_count_before_fsck: u16,
	/// The ext2 signature.
	signature: u16,
	/// The filesystem's state.
	fs_state: u16,
	/// The action to perform when an error is detected.
	error_action: u16,
	/// The minor version.
	minor_version: u16,
	/// The timestamp of the last consistency check.
	last_fsck_timestamp: u32,
	/// The interval between mandatory consistency checks.
	fsck_interval: u32,
	/// The id of the operating system from which the filesystem was created.
	os_id: u32,
	/// The major version.
	major_version: u32,
	/// The UID of the user that can use reserved blocks.
	uid_reserved: u16,
	/// The GID of the group that can use reserved blocks.
	gid_reserved: u16,

	// Extended superblock fields

	/// The first non reserved inode.
	first_non_reserved_inode: u32,
	/// The size of the inode structure in bytes.
	inode_size: u16,
	/// The block group containing the superblock.
	superblock_group: u16,
	/// Optional features for the implementation to support.
	optional_features: u32,
	/// Required features for the implementation to support.
	required_features: u32,
	/// Required features for the implementation to support for writing.
	write_required_features: u32,
	/// The filesystem id.
	filesystem_id: [u8; 16],
	/// The volume name.
	volume_name: [u8; 16],
	/// The path the volume was last mounted to.
	last_mount_path: [u8; 64],
	/// Used compression algorithms.
	compression_algorithms: u32,
	/// The number of blocks to preallocate for files.
	files_preallocate_count: u8,
	/// The number of blocks to preallocate for directories.
	directories_preallocate_count: u8,
	/// Unused.
	_unused: u16,
	/// The journal ID.
	journal_id: [u8; 16],
	/// The journal inode.
	journal_inode: u32,
	/// The journal device.
	journal_device: u32,
	/// The head of the orphan inodes list.
	orphan_inode_head: u32,

	/// Structure padding.
	_padding: [u8; 788],
}

impl Superblock {
	fn zeroed() -> Self {
		unsafe { std::mem::zeroed() }
	}

	/// Tells whether the superblock describes a mountable filesystem for a
	/// device of `device_blocks` blocks.
	fn is_valid(&self, device_blocks: u32) -> bool {
		if self.signature != EXT2_SIGNATURE {
			return false;
		}
		if 1024u32.checked_shl(self.block_size_log) != Some(BLOCK_SIZE) {
			return false;
		}
		if self.first_data_block != 1 {
			return false;
		}
		if self.inodes_per_group == 0 || self.inodes_per_group > 8 * BLOCK_SIZE {
			return false;
		}
		if self.first_non_reserved_inode != FIRST_NON_RESERVED_INODE {
			return false;
		}
		if self.inode_size != INODE_SIZE as u16 {
			return false;
		}
		if self.blocks_per_group != 8 * BLOCK_SIZE {
			return false;
		}
		let groups_count = self.total_inodes / self.inodes_per_group;
		groups_count >= 1
			&& groups_count
				.checked_mul(self.blocks_per_group)
				.is_some_and(|blocks| blocks < device_blocks)
	}
}

/// A block group descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GroupDescriptor {
	/// The block address of the block usage bitmap.
	block_bitmap_block: u32,
	/// The block address of the inode usage bitmap.
	inode_bitmap_block: u32,
	/// Starting block address of the inode table.
	inode_table_block: u32,
	/// Number of unallocated blocks in the group.
	free_blocks_count: u16,
	/// Number of unallocated inodes in the group.
	free_inodes_count: u16,
	/// Number of directories in the group.
	used_dirs_count: u16,

	/// Structure padding.
	_padding: [u8; 14],
}

/// The filesystem engine.
pub struct Ext2 {
	cache: Cache,
	layout: Layout,

	/// In-memory copy of the primary superblock.
	superblock: Superblock,
	/// In-memory copy of the primary group descriptor table.
	group_desc: Vec<GroupDescriptor>,
}

impl Ext2 {
	/// Opens the filesystem held by `cache`.
	///
	/// If the device does not contain a valid filesystem, it is formatted.
	pub fn open(cache: Cache) -> Result<Self> {
		let device_blocks = cache.blocks_count();
		let mut fs = Self {
			cache,
			layout: Layout::compute(device_blocks as u64 * BLOCK_SIZE as u64, BLOCK_SIZE),
			superblock: Superblock::zeroed(),
			group_desc: Vec::new(),
		};

		let mut buf = [0u8; BLOCK_SIZE as usize];
		fs.read_block(1, &mut buf)?;
		let sb: Superblock = util::read_struct(&buf);
		if sb.is_valid(device_blocks) {
			fs.superblock = sb;
			fs.layout = Layout::from_superblock(
				sb.total_inodes / sb.inodes_per_group,
				sb.blocks_per_group,
				sb.inodes_per_group,
			);
			fs.load_group_descriptors()?;
		} else {
			fs.format()?;
		}
		Ok(fs)
	}

	/// Returns the filesystem geometry.
	pub fn layout(&self) -> &Layout {
		&self.layout
	}

	/// Returns the block group holding the inode `n`.
	pub fn group_of_inode(&self, n: u32) -> u32 {
		(n - 1) / self.layout.inodes_per_group
	}

	/// Returns the number of unallocated blocks.
	pub fn free_blocks_count(&self) -> u32 {
		self.superblock.free_blocks_count
	}

	/// Returns the number of unallocated inodes.
	pub fn free_inodes_count(&self) -> u32 {
		self.superblock.free_inodes_count
	}

	/// Reads the block `blk` into `buf` through the cache.
	pub(crate) fn read_block(&mut self, blk: u32, buf: &mut [u8]) -> Result<()> {
		self.cache.read_block(blk, buf)?;
		Ok(())
	}

	/// Writes `buf` to the block `blk` through the cache.
	pub(crate) fn write_block(&mut self, blk: u32, buf: &[u8]) -> Result<()> {
		self.cache.write_block(blk, buf)?;
		Ok(())
	}

	/// Fills the block `blk` with zeros.
	pub(crate) fn zero_block(&mut self, blk: u32) -> Result<()> {
		self.write_block(blk, &[0u8; BLOCK_SIZE as usize])
	}

	/// Synchronizes cached writes to the backing device.
	pub fn sync(&mut self) -> Result<()> {
		self.superblock.last_write_timestamp = util::get_timestamp().as_secs() as u32;
		self.flush_metadata()?;
		self.cache.flush_all()?;
		Ok(())
	}

	/// Writes the primary superblock and group descriptor table back through
	/// the cache.
	///
	/// The redundant per-group copies are only refreshed by `format`.
	fn flush_metadata(&mut self) -> Result<()> {
		let sb = self.superblock;
		self.write_block(1, util::reinterpret(&sb))?;
		self.write_group_desc_table(0)
	}

	/// Writes the group descriptor table into the group `group`'s copy.
	fn write_group_desc_table(&mut self, group: u32) -> Result<()> {
		let mut buf =
			vec![0u8; (self.layout.gdt_blocks * BLOCK_SIZE) as usize];
		for (i, desc) in self.group_desc.iter().enumerate() {
			let off = i * GROUP_DESC_SIZE as usize;
			buf[off..off + GROUP_DESC_SIZE as usize].copy_from_slice(util::reinterpret(desc));
		}
		let first = self.layout.group_first_block(group) + 1;
		for i in 0..self.layout.gdt_blocks {
			let off = (i * BLOCK_SIZE) as usize;
			self.write_block(first + i, &buf[off..off + BLOCK_SIZE as usize])?;
		}
		Ok(())
	}

	/// Reads the primary group descriptor table into memory.
	fn load_group_descriptors(&mut self) -> Result<()> {
		let mut buf =
			vec![0u8; (self.layout.gdt_blocks * BLOCK_SIZE) as usize];
		for i in 0..self.layout.gdt_blocks {
			let off = (i * BLOCK_SIZE) as usize;
			let mut blk = [0u8; BLOCK_SIZE as usize];
			self.read_block(2 + i, &mut blk)?;
			buf[off..off + BLOCK_SIZE as usize].copy_from_slice(&blk);
		}
		self.group_desc = (0..self.layout.groups_count as usize)
			.map(|i| util::read_struct(&buf[i * GROUP_DESC_SIZE as usize..]))
			.collect();
		Ok(())
	}

	/// Formats the device and creates the root directory.
	pub fn format(&mut self) -> Result<()> {
		let layout = Layout::compute(
			self.cache.blocks_count() as u64 * BLOCK_SIZE as u64,
			BLOCK_SIZE,
		);
		self.layout = layout;
		let timestamp = util::get_timestamp().as_secs() as u32;

		// boot block
		let mut buf = [0u8; BLOCK_SIZE as usize];
		buf[..BOOT_SIGNATURE.len()].copy_from_slice(BOOT_SIGNATURE);
		self.write_block(0, &buf)?;

		let mut superblock = Superblock::zeroed();
		superblock.total_inodes = layout.total_inodes();
		superblock.total_blocks = layout.total_blocks();
		superblock.free_blocks_count = layout.data_blocks * layout.groups_count;
		superblock.free_inodes_count = layout.total_inodes() - RESERVED_INODES;
		superblock.first_data_block = 1;
		superblock.block_size_log = util::log2(BLOCK_SIZE as u64 / 1024).unwrap_or(0) as u32;
		superblock.fragment_size_log = superblock.block_size_log;
		superblock.blocks_per_group = layout.blocks_per_group;
		superblock.fragments_per_group = layout.blocks_per_group;
		superblock.inodes_per_group = layout.inodes_per_group;
		superblock.last_write_timestamp = timestamp;
		superblock.mount_count_before_fsck = FSCK_MOUNT_COUNT;
		superblock.signature = EXT2_SIGNATURE;
		superblock.fs_state = FS_STATE_CLEAN;
		superblock.error_action = ERR_ACTION_CONTINUE;
		superblock.last_fsck_timestamp = timestamp;
		superblock.fsck_interval = FSCK_INTERVAL;
		superblock.os_id = OS_ID_LINUX;
		superblock.first_non_reserved_inode = FIRST_NON_RESERVED_INODE;
		superblock.inode_size = INODE_SIZE as u16;
		superblock.filesystem_id = *Uuid::new_v4().as_bytes();
		let mut volume_name = [0u8; 16];
		volume_name[..VOLUME_NAME.len()].copy_from_slice(VOLUME_NAME);
		superblock.volume_name = volume_name;
		self.superblock = superblock;

		self.group_desc = (0..layout.groups_count)
			.map(|g| GroupDescriptor {
				block_bitmap_block: layout.block_bitmap_block(g),
				inode_bitmap_block: layout.inode_bitmap_block(g),
				inode_table_block: layout.inode_table_block(g),
				free_blocks_count: layout.data_blocks as u16,
				free_inodes_count: layout.inodes_per_group as u16,
				used_dirs_count: 0,
				_padding: [0; 14],
			})
			.collect();
		// inodes 1..=10 are reserved, all of them live in group 0
		self.group_desc[0].free_inodes_count -= RESERVED_INODES as u16;

		// superblock and GDT copies at the head of every group
		let sb = self.superblock;
		for g in 0..layout.groups_count {
			self.write_block(layout.group_first_block(g), util::reinterpret(&sb))?;
			self.write_group_desc_table(g)?;
		}

		// zero every bitmap and inode table block
		for g in 0..layout.groups_count {
			let first = layout.block_bitmap_block(g);
			let end = layout.inode_table_block(g) + layout.itbl_blocks;
			for blk in first..end {
				self.zero_block(blk)?;
			}
		}

		// pre-set the metadata region in each group's block bitmap
		for g in 0..layout.groups_count {
			let mut buf = [0u8; BLOCK_SIZE as usize];
			{
				let mut bm = Bitmap::new(&mut buf, layout.blocks_per_group);
				for pos in 0..layout.metadata_blocks() {
					bm.set(pos);
				}
			}
			self.write_block(layout.block_bitmap_block(g), &buf)?;
		}

		// mark the reserved inodes in group 0
		let mut buf = [0u8; BLOCK_SIZE as usize];
		{
			let mut bm = Bitmap::new(&mut buf, layout.inodes_per_group);
			for pos in 0..RESERVED_INODES {
				bm.set(pos);
			}
		}
		self.write_block(layout.inode_bitmap_block(0), &buf)?;

		// root directory
		let root_block = self.balloc(0)?;
		let mut buf = [0u8; BLOCK_SIZE as usize];
		dirent::init_first_block(&mut buf, ROOT_INODE, ROOT_INODE);
		self.write_block(root_block, &buf)?;

		let mut root = Inode::new(FileType::Directory, 0o755, 0, 0, timestamp);
		root.size = BLOCK_SIZE;
		root.used_sectors = inode::SECTORS_PER_BLOCK;
		root.block_ptrs[0] = root_block;
		self.write_inode(ROOT_INODE, &root)?;
		self.group_desc[0].used_dirs_count += 1;

		self.flush_metadata()?;
		self.cache.flush_all()?;
		Ok(())
	}

	/// Returns the position of the inode `n` as (block, byte offset).
	fn inode_position(&self, n: u32) -> (u32, usize) {
		assert!(n >= 1);
		let group = (n - 1) / self.layout.inodes_per_group;
		assert!(group < self.layout.groups_count);
		let index = (n - 1) % self.layout.inodes_per_group;

		let blk = self.layout.inode_table_block(group) + index / INODES_PER_BLOCK;
		let off = ((index % INODES_PER_BLOCK) * INODE_SIZE) as usize;
		(blk, off)
	}

	/// Reads the inode `n` from the inode table.
	///
	/// The inode bitmap is not consulted.
	pub fn read_inode(&mut self, n: u32) -> Result<Inode> {
		let (blk, off) = self.inode_position(n);
		let mut buf = [0u8; BLOCK_SIZE as usize];
		self.read_block(blk, &mut buf)?;
		Ok(util::read_struct(&buf[off..off + INODE_SIZE as usize]))
	}

	/// Writes the inode `n` to the inode table.
	///
	/// The inode bitmap is not modified.
	pub fn write_inode(&mut self, n: u32, inode: &Inode) -> Result<()> {
		let (blk, off) = self.inode_position(n);
		let mut buf = [0u8; BLOCK_SIZE as usize];
		self.read_block(blk, &mut buf)?;
		buf[off..off + INODE_SIZE as usize].copy_from_slice(util::reinterpret(inode));
		self.write_block(blk, &buf)
	}

	/// Finds a free inode, marks it used and returns its number.
	///
	/// Groups are scanned in order; reserved inode numbers are skipped.
	pub fn ialloc(&mut self) -> Result<u32> {
		for group in 0..self.layout.groups_count {
			let bitmap_blk = self.layout.inode_bitmap_block(group);
			let mut buf = [0u8; BLOCK_SIZE as usize];
			self.read_block(bitmap_blk, &mut buf)?;

			let found = {
				let mut bm = Bitmap::new(&mut buf, self.layout.inodes_per_group);
				let mut pos = 0;
				loop {
					pos = bm.next_bit(pos, false);
					if pos == NO_BIT {
						break None;
					}
					let inode = group * self.layout.inodes_per_group + pos + 1;
					if inode < FIRST_NON_RESERVED_INODE {
						pos += 1;
						continue;
					}
					bm.set(pos);
					break Some(inode);
				}
			};
			if let Some(inode) = found {
				self.write_block(bitmap_blk, &buf)?;
				self.group_desc[group as usize].free_inodes_count -= 1;
				self.superblock.free_inodes_count -= 1;
				self.flush_metadata()?;
				return Ok(inode);
			}
		}
		Err(Error::NoSpace)
	}

	/// Allocates an inode and initializes its record in the inode table.
	///
	/// On success, returns the inode number and the written record.
	pub fn create_inode(
		&mut self,
		file_type: FileType,
		perms: u16,
		uid: u16,
		gid: u16,
	) -> Result<(u32, Inode)> {
		let n = self.ialloc()?;
		let timestamp = util::get_timestamp().as_secs() as u32;
		let inode = Inode::new(file_type, perms, uid, gid, timestamp);
		self.write_inode(n, &inode)?;

		if file_type == FileType::Directory {
			let group = self.group_of_inode(n);
			self.group_desc[group as usize].used_dirs_count += 1;
			self.flush_metadata()?;
		}
		Ok((n, inode))
	}

	/// Releases the inode `n`: frees every content block reachable from it,
	/// then clears its bitmap bit.
	///
	/// Reserved inode numbers are ignored.
	pub fn ifree(&mut self, n: u32) -> Result<()> {
		if n < FIRST_NON_RESERVED_INODE {
			return Ok(());
		}
		let mut inode = self.read_inode(n)?;
		let is_dir = inode.file_type() == Some(FileType::Directory);
		inode.free_content(self)?;
		inode.dtime = util::get_timestamp().as_secs() as u32;
		inode.links_count = 0;
		self.write_inode(n, &inode)?;

		let group = self.group_of_inode(n);
		let pos = (n - 1) % self.layout.inodes_per_group;
		let bitmap_blk = self.layout.inode_bitmap_block(group);
		let mut buf = [0u8; BLOCK_SIZE as usize];
		self.read_block(bitmap_blk, &mut buf)?;
		{
			let mut bm = Bitmap::new(&mut buf, self.layout.inodes_per_group);
			assert!(bm.get(pos), "freeing a free inode");
			bm.reset(pos);
		}
		self.write_block(bitmap_blk, &buf)?;

		self.group_desc[group as usize].free_inodes_count += 1;
		self.superblock.free_inodes_count += 1;
		if is_dir {
			self.group_desc[group as usize].used_dirs_count -= 1;
		}
		self.flush_metadata()
	}

	/// Allocates `count` blocks, preferring the group `preferred_group`.
	///
	/// Groups are walked cyclically from the preferred one; inside a group
	/// the lowest clear bits are taken. If the device cannot provide `count`
	/// blocks, the partial allocation is rolled back and [`Error::NoSpace`]
	/// is returned.
	pub fn ballocs(&mut self, preferred_group: u32, count: usize) -> Result<Vec<u32>> {
		assert!(count > 0);
		let groups_count = self.layout.groups_count;
		let mut ret = Vec::with_capacity(count);

		for k in 0..groups_count {
			let group = (preferred_group + k) % groups_count;
			let bitmap_blk = self.layout.block_bitmap_block(group);
			let mut buf = [0u8; BLOCK_SIZE as usize];
			self.read_block(bitmap_blk, &mut buf)?;

			let mut taken: u16 = 0;
			{
				let mut bm = Bitmap::new(&mut buf, self.layout.blocks_per_group);
				let mut pos = 0;
				while ret.len() < count {
					pos = bm.next_bit(pos, false);
					if pos == NO_BIT {
						break;
					}
					bm.set(pos);
					ret.push(self.layout.group_first_block(group) + pos);
					taken += 1;
				}
			}
			if taken > 0 {
				self.write_block(bitmap_blk, &buf)?;
				self.group_desc[group as usize].free_blocks_count -= taken;
				self.superblock.free_blocks_count -= taken as u32;
			}
			if ret.len() == count {
				self.flush_metadata()?;
				return Ok(ret);
			}
		}

		// not enough blocks on the whole device: roll back
		for blk in ret {
			self.bfree(blk)?;
		}
		Err(Error::NoSpace)
	}

	/// Allocates one block, preferring the group `preferred_group`.
	pub fn balloc(&mut self, preferred_group: u32) -> Result<u32> {
		Ok(self.ballocs(preferred_group, 1)?[0])
	}

	/// Releases the block `blk`. A zero index is ignored.
	pub fn bfree(&mut self, blk: u32) -> Result<()> {
		if blk == 0 {
			return Ok(());
		}
		let group = (blk - 1) / self.layout.blocks_per_group;
		let pos = (blk - 1) % self.layout.blocks_per_group;
		assert!(group < self.layout.groups_count);
		assert!(pos >= self.layout.metadata_blocks(), "freeing a metadata block");

		let bitmap_blk = self.layout.block_bitmap_block(group);
		let mut buf = [0u8; BLOCK_SIZE as usize];
		self.read_block(bitmap_blk, &mut buf)?;
		{
			let mut bm = Bitmap::new(&mut buf, self.layout.blocks_per_group);
			assert!(bm.get(pos), "freeing a free block");
			bm.reset(pos);
		}
		self.write_block(bitmap_blk, &buf)?;

		self.group_desc[group as usize].free_blocks_count += 1;
		self.superblock.free_blocks_count += 1;
		self.flush_metadata()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::disk::Disk;
	use std::env;
	use std::fs;
	use std::mem::size_of;
	use std::path::PathBuf;

	fn temp_path(name: &str) -> PathBuf {
		env::temp_dir().join(format!("mfs-ext2-{}-{}", std::process::id(), name))
	}

	fn open_fs(path: &PathBuf) -> Ext2 {
		let disk = Disk::open(path, 16 * 1024 * 1024).unwrap();
		Ext2::open(Cache::new(disk, 64)).unwrap()
	}

	#[test]
	fn record_sizes() {
		assert_eq!(size_of::<Superblock>(), 1024);
		assert_eq!(size_of::<GroupDescriptor>(), GROUP_DESC_SIZE as usize);
	}

	#[test]
	fn format_counters() {
		let path = temp_path("format.img");
		let _ = fs::remove_file(&path);

		let fs = open_fs(&path);
		let layout = *fs.layout();
		// one block taken by the root directory
		assert_eq!(
			fs.free_blocks_count(),
			layout.data_blocks * layout.groups_count - 1
		);
		assert_eq!(
			fs.free_inodes_count(),
			layout.total_inodes() - RESERVED_INODES
		);
		let used_dirs = fs.group_desc[0].used_dirs_count;
		assert_eq!(used_dirs, 1);

		drop(fs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn mount_round_trip() {
		let path = temp_path("mount.img");
		let _ = fs::remove_file(&path);

		let (free_blocks, free_inodes, fs_id) = {
			let mut fs = open_fs(&path);
			fs.ialloc().unwrap();
			fs.balloc(0).unwrap();
			fs.sync().unwrap();
			(
				fs.free_blocks_count(),
				fs.free_inodes_count(),
				fs.superblock.filesystem_id,
			)
		};

		// reopening must mount, not reformat
		let fs = open_fs(&path);
		assert_eq!(fs.free_blocks_count(), free_blocks);
		assert_eq!(fs.free_inodes_count(), free_inodes);
		let id = fs.superblock.filesystem_id;
		assert_eq!(id, fs_id);

		drop(fs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn bad_superblock_reformats() {
		let path = temp_path("reformat.img");
		let _ = fs::remove_file(&path);

		let old_id = {
			let fs = open_fs(&path);
			fs.superblock.filesystem_id
		};

		// corrupt the primary superblock
		let mut disk = Disk::open(&path, 16 * 1024 * 1024).unwrap();
		disk.write_block(1, &[0xffu8; BLOCK_SIZE as usize]).unwrap();
		disk.sync().unwrap();
		drop(disk);

		let fs = open_fs(&path);
		let signature = fs.superblock.signature;
		assert_eq!(signature, EXT2_SIGNATURE);
		let new_id = fs.superblock.filesystem_id;
		assert_ne!(new_id, old_id);

		drop(fs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn ialloc_no_reuse_until_free() {
		let path = temp_path("ialloc.img");
		let _ = fs::remove_file(&path);

		let mut fs = open_fs(&path);
		let a = fs.ialloc().unwrap();
		assert_eq!(a, FIRST_NON_RESERVED_INODE);
		let b = fs.ialloc().unwrap();
		let c = fs.ialloc().unwrap();
		assert!(a != b && b != c && a != c);

		// freeing makes the number available again, lowest first
		let empty = Inode::new(FileType::Regular, 0o644, 0, 0, 0);
		fs.write_inode(b, &empty).unwrap();
		fs.ifree(b).unwrap();
		assert_eq!(fs.ialloc().unwrap(), b);

		drop(fs);
		fs::remove_file(&path).unwrap();
	}

	#[test]
	fn balloc_no_reuse_until_free() {
		let path = temp_path("balloc.img");
		let _ = fs::remove_file(&path);

		let mut fs = open_fs(&path);
		let blocks = fs.ballocs(0, 4).unwrap();
		let mut uniq = blocks.clone();
		uniq.sort_unstable();
		uniq.dedup();
		assert_eq!(uniq.len(), 4);
		// allocated blocks always land past the metadata region
		for blk in &blocks {
			assert!((blk - 1) % fs.layout().blocks_per_group >= fs.layout().metadata_blocks());
		}

		let free_before = fs.free_blocks_count();
		fs.bfree(blocks[2]).unwrap();
		assert_eq!(fs.free_blocks_count(), free_before + 1);
		assert_eq!(fs.balloc(0).unwrap(), blocks[2]);

		drop(fs);
		fs::remove_file(&path).unwrap();
	}
}
