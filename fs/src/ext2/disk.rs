//! ext2 rev 1 on-disk structures and their little-endian codecs.

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT2_ROOT_INODE: u32 = 2;
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT2_VALID_FS: u16 = 1;
pub const EXT2_DYNAMIC_REV: u32 = 1;

pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_BTREE_DIR: u32 = 0x0004;

pub const NDIR_BLOCKS: usize = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
pub const TIND_BLOCK: usize = 14;
pub const N_BLOCKS: usize = 15;

/// Symlink targets up to this many bytes live inline in `i_block`.
pub const MAX_INLINE_SYMLINK: usize = 60;

/// Logical file size ceiling.
pub const FILE_MAX_SIZE: u64 = 0x7FFF_FFFF;

pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

pub const DIR_ENTRY_HEADER: usize = 8;
pub const GROUP_DESC_SIZE: usize = 32;

#[derive(Debug, Copy, Clone)]
pub struct SuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

pub fn parse_superblock(data: &[u8]) -> SuperBlock {
    SuperBlock {
        inodes_count: le32(data, 0),
        blocks_count: le32(data, 4),
        free_blocks_count: le32(data, 12),
        free_inodes_count: le32(data, 16),
        first_data_block: le32(data, 20),
        log_block_size: le32(data, 24),
        log_frag_size: le32(data, 28),
        blocks_per_group: le32(data, 32),
        inodes_per_group: le32(data, 40),
        magic: le16(data, 56),
        state: le16(data, 58),
        rev_level: le32(data, 76),
        first_ino: le32(data, 84),
        inode_size: le16(data, 88),
        feature_compat: le32(data, 92),
        feature_incompat: le32(data, 96),
        feature_ro_compat: le32(data, 100),
    }
}

/// Patch the mutable superblock fields into an on-disk image.
pub fn encode_superblock_updates(data: &mut [u8], sb: &SuperBlock) {
    put32(data, 12, sb.free_blocks_count);
    put32(data, 16, sb.free_inodes_count);
    put16(data, 58, sb.state);
}

#[derive(Debug, Copy, Clone, Default)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

pub fn parse_group_descriptor(data: &[u8]) -> GroupDescriptor {
    GroupDescriptor {
        block_bitmap: le32(data, 0),
        inode_bitmap: le32(data, 4),
        inode_table: le32(data, 8),
        free_blocks_count: le16(data, 12),
        free_inodes_count: le16(data, 14),
        used_dirs_count: le16(data, 16),
    }
}

pub fn encode_group_descriptor(data: &mut [u8], desc: &GroupDescriptor) {
    put32(data, 0, desc.block_bitmap);
    put32(data, 4, desc.inode_bitmap);
    put32(data, 8, desc.inode_table);
    put16(data, 12, desc.free_blocks_count);
    put16(data, 14, desc.free_inodes_count);
    put16(data, 16, desc.used_dirs_count);
}

#[derive(Debug, Copy, Clone, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512-byte sectors occupied, indirection blocks included.
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; N_BLOCKS],
}

pub fn parse_inode(data: &[u8]) -> DiskInode {
    let mut block = [0u32; N_BLOCKS];
    for (i, slot) in block.iter_mut().enumerate() {
        *slot = le32(data, 40 + i * 4);
    }
    DiskInode {
        mode: le16(data, 0),
        uid: le16(data, 2),
        size: le32(data, 4),
        atime: le32(data, 8),
        ctime: le32(data, 12),
        mtime: le32(data, 16),
        dtime: le32(data, 20),
        gid: le16(data, 24),
        links_count: le16(data, 26),
        blocks: le32(data, 28),
        flags: le32(data, 32),
        block,
    }
}

pub fn encode_inode(data: &mut [u8], inode: &DiskInode) {
    data.fill(0);
    put16(data, 0, inode.mode);
    put16(data, 2, inode.uid);
    put32(data, 4, inode.size);
    put32(data, 8, inode.atime);
    put32(data, 12, inode.ctime);
    put32(data, 16, inode.mtime);
    put32(data, 20, inode.dtime);
    put16(data, 24, inode.gid);
    put16(data, 26, inode.links_count);
    put32(data, 28, inode.blocks);
    put32(data, 32, inode.flags);
    for (i, value) in inode.block.iter().enumerate() {
        put32(data, 40 + i * 4, *value);
    }
}

impl DiskInode {
    /// The `i_block` area reinterpreted as the inline symlink target.
    pub fn inline_bytes(&self) -> [u8; MAX_INLINE_SYMLINK] {
        let mut out = [0u8; MAX_INLINE_SYMLINK];
        for (i, chunk) in out.chunks_mut(4).enumerate() {
            chunk.copy_from_slice(&self.block[i].to_le_bytes());
        }
        out
    }

    pub fn set_inline_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_INLINE_SYMLINK);
        self.block = [0; N_BLOCKS];
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.block[i] = u32::from_le_bytes(word);
        }
    }
}

/// Directory record sizes are 4-byte aligned.
#[inline]
pub const fn dir_entry_size(name_len: usize) -> usize {
    (DIR_ENTRY_HEADER + name_len + 3) & !3
}

pub fn mode_to_dirent_file_type(mode: u16) -> u8 {
    use ferrox_abi::fs::{mode_is_directory, mode_is_regular, mode_is_symlink};
    if mode_is_directory(mode) {
        FT_DIR
    } else if mode_is_regular(mode) {
        FT_REG_FILE
    } else if mode_is_symlink(mode) {
        FT_SYMLINK
    } else {
        FT_UNKNOWN
    }
}

#[inline]
pub fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn put16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_codec_round_trips() {
        let mut inode = DiskInode {
            mode: 0x81A4,
            size: 123456,
            links_count: 3,
            blocks: 242,
            ..DiskInode::default()
        };
        inode.block[0] = 77;
        inode.block[IND_BLOCK] = 901;

        let mut raw = [0u8; 128];
        encode_inode(&mut raw, &inode);
        let back = parse_inode(&raw);
        assert_eq!(back.mode, inode.mode);
        assert_eq!(back.size, inode.size);
        assert_eq!(back.links_count, inode.links_count);
        assert_eq!(back.blocks, inode.blocks);
        assert_eq!(back.block, inode.block);
    }

    #[test]
    fn inline_symlink_bytes_round_trip() {
        let mut inode = DiskInode::default();
        inode.set_inline_bytes(b"../some/where");
        assert_eq!(&inode.inline_bytes()[..13], b"../some/where");
    }

    #[test]
    fn dir_entry_sizes_are_aligned() {
        assert_eq!(dir_entry_size(1), 12);
        assert_eq!(dir_entry_size(2), 12);
        assert_eq!(dir_entry_size(4), 12);
        assert_eq!(dir_entry_size(5), 16);
    }
}
