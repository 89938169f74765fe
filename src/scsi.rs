//! SCSI status, sense data and command-result mapping
//!
//! The passthrough backend never interprets initiator CDBs itself; it only
//! needs the status bytes and sense encoding used to report a command's
//! outcome back to the target core, plus a few CDB field helpers that
//! peripherals (such as the in-memory reference device) use.

use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes understood by the reference peripheral
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
    Read16 = 0x88,
    Write16 = 0x8A,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            _ => None,
        }
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length: remaining bytes after this field
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn lba_out_of_range(lba: u64) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            .with_info(lba.min(u32::MAX as u64) as u32)
    }

    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0)
    }

    /// Sense reported for a command the peripheral failed outright
    pub fn internal_target_failure() -> Self {
        SenseData::new(sense_key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0)
    }

    /// Sense a core may encode when a submit is refused with `NotReady`
    pub fn lun_not_available() -> Self {
        SenseData::new(sense_key::NOT_READY, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }
}

/// Final outcome of one command, as handed to the target core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command succeeded
    Good,
    /// Peripheral reported a CHECK CONDITION with its own sense data
    CheckCondition(SenseData),
    /// Peripheral rejected or failed the command
    IoError(String),
    /// Peripheral aborted the command before it finished
    Aborted,
}

impl CommandStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, CommandStatus::Good)
    }

    /// SCSI status byte for this outcome
    pub fn scsi_status(&self) -> u8 {
        match self {
            CommandStatus::Good => scsi_status::GOOD,
            CommandStatus::CheckCondition(_) | CommandStatus::IoError(_) => {
                scsi_status::CHECK_CONDITION
            }
            CommandStatus::Aborted => scsi_status::TASK_ABORTED,
        }
    }

    /// Sense data accompanying a CHECK CONDITION, if any
    pub fn sense(&self) -> Option<SenseData> {
        match self {
            CommandStatus::CheckCondition(sense) => Some(sense.clone()),
            CommandStatus::IoError(_) => Some(SenseData::internal_target_failure()),
            _ => None,
        }
    }
}

/// Parse LBA and transfer length from a READ/WRITE (10) or (16) CDB
pub fn parse_rw_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    match cdb.first().copied().and_then(ScsiOpcode::from_u8)? {
        ScsiOpcode::Read10 | ScsiOpcode::Write10 if cdb.len() >= 10 => {
            let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
            let length = BigEndian::read_u16(&cdb[7..9]) as u32;
            Some((lba, length))
        }
        ScsiOpcode::Read16 | ScsiOpcode::Write16 if cdb.len() >= 16 => {
            let lba = BigEndian::read_u64(&cdb[2..10]);
            let length = BigEndian::read_u32(&cdb[10..14]);
            Some((lba, length))
        }
        _ => None,
    }
}

/// Build a READ (10) CDB
pub fn read10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    rw10_cdb(ScsiOpcode::Read10, lba, blocks)
}

/// Build a WRITE (10) CDB
pub fn write10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    rw10_cdb(ScsiOpcode::Write10, lba, blocks)
}

fn rw10_cdb(opcode: ScsiOpcode, lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0u8; 10];
    cdb[0] = opcode as u8;
    BigEndian::write_u32(&mut cdb[2..6], lba);
    BigEndian::write_u16(&mut cdb[7..9], blocks);
    cdb
}

/// Encode READ CAPACITY (10) parameter data (8 bytes)
pub fn read_capacity_10_data(blocks: u64, block_size: u32) -> Vec<u8> {
    let mut data = vec![0u8; 8];

    // Last LBA, or 0xFFFFFFFF to steer the initiator to READ CAPACITY (16)
    let last_lba = blocks.saturating_sub(1);
    let last_lba_32 = if last_lba > 0xFFFF_FFFE {
        0xFFFF_FFFF_u32
    } else {
        last_lba as u32
    };

    BigEndian::write_u32(&mut data[0..4], last_lba_32);
    BigEndian::write_u32(&mut data[4..8], block_size);
    data
}

/// Encode READ CAPACITY (16) parameter data (32 bytes)
pub fn read_capacity_16_data(blocks: u64, block_size: u32) -> Vec<u8> {
    let mut data = vec![0u8; 32];
    BigEndian::write_u64(&mut data[0..8], blocks.saturating_sub(1));
    BigEndian::write_u32(&mut data[8..12], block_size);
    data
}
