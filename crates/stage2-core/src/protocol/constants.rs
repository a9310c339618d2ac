// Frame sentinel
pub const CMD_MAGIC: u32 = 0xF00DD00D;

// Opcodes (sent big-endian after the sentinel)
pub const CMD_READ_SECTOR: u32 = 0x1000;
pub const CMD_SELECT_PARTITION: u32 = 0x1002;
pub const CMD_READ_RPMB: u32 = 0x2000;
pub const CMD_REBOOT: u32 = 0x3000;
pub const CMD_WRITE_MEM: u32 = 0x4000;
pub const CMD_READ_MEM: u32 = 0x4002;
pub const CMD_INIT_EMMC: u32 = 0x6001;

// Acknowledgement patterns
pub const ACK_WRITE_OK: [u8; 4] = [0xD0, 0xD0, 0xD0, 0xD0];
pub const ACK_EMMC_OK: [u8; 4] = [0xD1, 0xD1, 0xD1, 0xD1];
pub const ACK_LEN: usize = 4;

// Partition selectors for CMD_SELECT_PARTITION
pub const PART_USER: u32 = 0;
pub const PART_BOOT1: u32 = 1;
pub const PART_BOOT2: u32 = 2;
pub const PART_RPMB: u32 = 3;

pub const EMMC_SECTOR_SIZE: usize = 0x200;
pub const RPMB_SECTOR_SIZE: usize = 0x100;

/// Memory transfers are split into chunks of this size.
pub const MEM_CHUNK_SIZE: usize = 0x100;

/// Hardware code register, read once at session start.
pub const HW_CODE_ADDR: u32 = 0x0800_0000;

pub const MTK_VENDOR_ID: u16 = 0x0E8D;
pub const MTK_PRELOADER_PID: u16 = 0x2000;
pub const MTK_BROM_PID: u16 = 0x0003;
pub const MTK_DA_PID: u16 = 0x2001;

pub const SUPPORTED_PIDS: &[u16] = &[MTK_BROM_PID, MTK_PRELOADER_PID, MTK_DA_PID];

// Preloader dump sizes
pub const PRELOADER_PROBE_SIZE: usize = 0x4000;
pub const PRELOADER_FLAT_SIZE: usize = 0x40000;

pub const DEFAULT_RPMB_SIZE: u64 = 4 * 1024 * 1024;
