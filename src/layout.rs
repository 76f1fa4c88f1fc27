//! Derivation of the on-disk geometry from the device size.
//!
//! A block group is sized so that a single block holds its block bitmap,
//! which bounds it to `8 * BLOCK_SIZE` blocks. The group is carved into a
//! superblock copy, the group descriptor table copy, the two bitmaps, the
//! inode table and the data area; the inode table is sized from the
//! bytes-per-inode rule.

use crate::util::ceil_division;

/// The size of a block in bytes.
pub const BLOCK_SIZE: u32 = 1024;
/// The default size of the backing file in bytes.
pub const DEFAULT_DISK_SIZE: u64 = 64 * 1024 * 1024 + 3 * 1024;
/// The size of an inode record in bytes.
pub const INODE_SIZE: u32 = 128;
/// The size of a group descriptor in bytes.
pub const GROUP_DESC_SIZE: u32 = 32;
/// The number of inode records held by one block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE;

/// The assumed average number of content bytes per inode, used to size a
/// group's inode table.
const BYTES_PER_INODE: u32 = 2048;

/// The filesystem geometry.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
	/// The number of full block groups. A trailing partial group is ignored.
	pub groups_count: u32,
	/// The number of blocks in each group.
	pub blocks_per_group: u32,
	/// The number of inodes in each group.
	pub inodes_per_group: u32,
	/// The number of blocks of the group descriptor table.
	pub gdt_blocks: u32,
	/// The number of blocks of a group's inode table.
	pub itbl_blocks: u32,
	/// The number of data blocks in each group.
	pub data_blocks: u32,
}

impl Layout {
	/// Computes the geometry for a device of `disk_size` bytes.
	pub fn compute(disk_size: u64, block_size: u32) -> Self {
		assert_eq!(block_size, BLOCK_SIZE);

		let total_blocks = (disk_size / block_size as u64) as u32;
		// block 0 is the boot block
		let available_blocks = total_blocks - 1;

		// bounded by the bitmap: one block covers 8 * block_size entries
		let blocks_per_group = 8 * block_size;
		let groups_count = available_blocks / blocks_per_group;
		assert!(groups_count > 0, "device too small for one block group");

		Self::with_groups(groups_count, blocks_per_group, None, block_size)
	}

	/// Rebuilds the geometry recorded in a superblock.
	///
	/// Arguments are the raw superblock fields; the caller has validated them.
	pub fn from_superblock(
		groups_count: u32,
		blocks_per_group: u32,
		inodes_per_group: u32,
	) -> Self {
		Self::with_groups(
			groups_count,
			blocks_per_group,
			Some(inodes_per_group),
			BLOCK_SIZE,
		)
	}

	fn with_groups(
		groups_count: u32,
		blocks_per_group: u32,
		inodes_per_group: Option<u32>,
		block_size: u32,
	) -> Self {
		let gdt_blocks = ceil_division(
			groups_count as u64 * GROUP_DESC_SIZE as u64,
			block_size as u64,
		) as u32;

		// the largest m with m * bytes_per_inode + m * inode_size fitting the
		// space left after the superblock, GDT and bitmap blocks
		let usable = (blocks_per_group - 3 - gdt_blocks) as u64 * block_size as u64;
		let inodes_per_group = inodes_per_group
			.unwrap_or((usable / (BYTES_PER_INODE + INODE_SIZE) as u64) as u32);

		let itbl_blocks = ceil_division(
			inodes_per_group as u64 * INODE_SIZE as u64,
			block_size as u64,
		) as u32;
		let data_blocks = blocks_per_group - 3 - gdt_blocks - itbl_blocks;
		assert_eq!(3 + gdt_blocks + itbl_blocks + data_blocks, blocks_per_group);

		Self {
			groups_count,
			blocks_per_group,
			inodes_per_group,
			gdt_blocks,
			itbl_blocks,
			data_blocks,
		}
	}

	/// Returns the first block of the group `group`.
	pub fn group_first_block(&self, group: u32) -> u32 {
		group * self.blocks_per_group + 1
	}

	/// Returns the block holding the block bitmap of the group `group`.
	pub fn block_bitmap_block(&self, group: u32) -> u32 {
		self.group_first_block(group) + 1 + self.gdt_blocks
	}

	/// Returns the block holding the inode bitmap of the group `group`.
	pub fn inode_bitmap_block(&self, group: u32) -> u32 {
		self.group_first_block(group) + 2 + self.gdt_blocks
	}

	/// Returns the first block of the inode table of the group `group`.
	pub fn inode_table_block(&self, group: u32) -> u32 {
		self.group_first_block(group) + 3 + self.gdt_blocks
	}

	/// Returns the number of metadata blocks at the beginning of each group.
	pub fn metadata_blocks(&self) -> u32 {
		3 + self.gdt_blocks + self.itbl_blocks
	}

	/// Returns the total number of inodes.
	pub fn total_inodes(&self) -> u32 {
		self.groups_count * self.inodes_per_group
	}

	/// Returns the total number of blocks covered by the groups.
	pub fn total_blocks(&self) -> u32 {
		self.groups_count * self.blocks_per_group
	}
}
