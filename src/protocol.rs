//! AN3155 wire-level pieces: command opcodes, frame checksums, and the
//! fixed-size frames the harness puts on the wire.

/// Discovery byte the ROM bootloader expects first after reset.
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Upper bound on a single bootloader memory read.
pub const MAX_CHUNK: usize = 256;

/// Longest frame sent by this harness: four address bytes plus checksum.
pub const MAX_FRAME: usize = 5;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by
    /// the application. NACKed while readout protection is active, which is
    /// exactly the gate the fault pulse aims at.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection. Mass-erases flash as a side effect,
    /// which is why the harness reads memory out instead of using this.
    ReadoutUnprotect = 0x92,
}

/// Bootloader frame checksum: single-byte payloads carry the complement of
/// the byte, longer payloads an XOR reduction.
pub fn checksum(payload: &[u8]) -> u8 {
    match *payload {
        [b] => !b,
        _ => payload.iter().fold(0, |c, b| c ^ b),
    }
}

/// One command frame: payload bytes followed by their checksum. Built fresh
/// for every transmission attempt, immutable afterwards.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Frame {
    buf: [u8; MAX_FRAME],
    len: usize,
}

impl Frame {
    /// Build a frame from a payload of at most `MAX_FRAME - 1` bytes.
    pub fn new(payload: &[u8]) -> Self {
        assert!(!payload.is_empty() && payload.len() < MAX_FRAME);

        let mut buf = [0u8; MAX_FRAME];
        buf[..payload.len()].copy_from_slice(payload);
        buf[payload.len()] = checksum(payload);

        Self {
            buf,
            len: payload.len() + 1,
        }
    }

    /// Single-opcode command frame, e.g. `{0x11, 0xEE}` for [`Command::ReadMemory`].
    pub fn command(command: Command) -> Self {
        Self::new(&[command as u8])
    }

    /// Address frame: four big-endian address bytes and their XOR.
    pub fn address(address: u32) -> Self {
        Self::new(&address.to_be_bytes())
    }

    /// Payload plus trailing checksum, as transmitted.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Payload without the checksum byte.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len - 1]
    }
}

/// Render leaked memory as hex, 16 bytes per line with a space after every
/// second byte.
pub fn dump_lines(data: &[u8]) -> Vec<String> {
    use core::fmt::Write;

    let mut lines = Vec::new();
    let mut line = String::new();

    for (i, b) in data.iter().enumerate() {
        if i % 16 != 0 && i % 2 == 0 {
            line.push(' ');
        }
        let _ = write!(&mut line, "{:02x}", b);
        if i % 16 == 15 {
            lines.push(core::mem::take(&mut line));
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_checksum_is_complement() {
        assert_eq!(checksum(&[0x11]), 0xEE);
        assert_eq!(checksum(&[0x04]), 0xFB);
        assert_eq!(checksum(&[0x00]), 0xFF);
        for b in 0..=0xFFu8 {
            assert_eq!(checksum(&[b]), !b);
        }
    }

    #[test]
    fn multi_byte_checksum_is_xor() {
        assert_eq!(checksum(&[0x08, 0x00, 0x00, 0x00]), 0x08);
        assert_eq!(checksum(&[0xAA, 0x55]), 0xFF);
        assert_eq!(checksum(&[0x01, 0x02, 0x04, 0x08]), 0x0F);
    }

    #[test]
    fn frame_appends_checksum() {
        let f = Frame::new(&[0x08, 0x00, 0x00, 0x00]);
        assert_eq!(f.bytes(), &[0x08, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(f.payload(), &[0x08, 0x00, 0x00, 0x00]);

        // Recomputing over the payload reproduces the trailing byte
        assert_eq!(checksum(f.payload()), *f.bytes().last().unwrap());
    }

    #[test]
    fn read_memory_command_frame() {
        assert_eq!(Frame::command(Command::ReadMemory).bytes(), &[0x11, 0xEE]);
    }

    #[test]
    fn address_frame_is_big_endian() {
        assert_eq!(
            Frame::address(0x0800_0000).bytes(),
            &[0x08, 0x00, 0x00, 0x00, 0x08]
        );
        assert_eq!(
            Frame::address(0x2000_1234).bytes(),
            &[0x20, 0x00, 0x12, 0x34, 0x06]
        );
    }

    #[test]
    fn dump_groups_sixteen_bytes_per_line() {
        let data: Vec<u8> = (0..20).collect();
        let lines = dump_lines(&data);
        assert_eq!(
            lines,
            vec![
                "0001 0203 0405 0607 0809 0a0b 0c0d 0e0f".to_string(),
                "1011 1213".to_string(),
            ]
        );
        assert!(dump_lines(&[]).is_empty());
    }
}
