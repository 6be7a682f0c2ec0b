//! ZestSC1 carrier board: enumeration, EEPROM identity, FPGA configuration
//! and the raw control/bulk transfer primitives everything else is built on.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rusb::{Direction, GlobalContext, Recipient, RequestType};
use thiserror::Error;

pub const ID_VENDOR: u16 = 0x165d;
pub const ID_PRODUCT: u16 = 0x0001;

const EP_WRITE_DATA: u8 = 0x02;
const EP_READ_DATA: u8 = 0x86;
const EP_READ_INT: u8 = 0x81;

const REQ_WRITE_REGISTER: u8 = 0xd0;
const REQ_READ_REGISTER: u8 = 0xd1;
const REQ_WRITE_CONFIG: u8 = 0xd2;
const REQ_READ_CONFIG: u8 = 0xd3;
const REQ_SIGNAL_DIRECTION: u8 = 0xd4;
const REQ_SET_SIGNAL: u8 = 0xd5;
const REQ_GET_SIGNAL: u8 = 0xd6;
const REQ_READ_EEPROM: u8 = 0xd8;
const REQ_FIRMWARE: u8 = 0xdc;
const REQ_RESET_8051: u8 = 0xa0;

const VALUE_8051: u16 = 0xe600;

const EEPROM_FPGA_TYPE: u16 = 0xfffa;
const EEPROM_CARD_ID: u16 = 0xfffb;
const EEPROM_SERIAL_NUMBER: u16 = 0xfffc;
const EEPROM_MEMORY_SIZE: u16 = 0xfff6;

const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    #[error("short transfer: {done} of {want} bytes")]
    Short { want: usize, done: usize },
    #[error("no board found with serial number {0}")]
    NotFound(u32),
    #[error("found {count} boards with serial number {serial}")]
    Ambiguous { serial: u32, count: usize },
    #[error("bad bitfile: {0}")]
    Bitfile(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed FPGA image. The four header sections are tagged variable-length
/// strings; `image` is the raw configuration stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitfile {
    pub name: String,
    pub part: String,
    pub date: String,
    pub time: String,
    pub image: Vec<u8>,
}

impl Bitfile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BoardError> {
        let mut f = File::open(path)?;
        Bitfile::parse(&mut f)
    }

    /// Section tags are single bytes 0x61..0x65; name/part/date/time carry a
    /// two-byte big-endian length, the image a four-byte one. Anything else
    /// is skipped.
    pub fn parse<R: Read>(r: &mut R) -> Result<Self, BoardError> {
        let mut name = None;
        let mut part = None;
        let mut date = None;
        let mut time = None;
        let mut image = None;

        let mut tag = [0u8; 1];
        loop {
            match r.read(&mut tag)? {
                0 => break,
                _ => {}
            }
            match tag[0] {
                0x61 => name = Some(read_section(r, 2)?),
                0x62 => part = Some(read_section(r, 2)?),
                0x63 => date = Some(read_section(r, 2)?),
                0x64 => time = Some(read_section(r, 2)?),
                0x65 => image = Some(read_section(r, 4)?),
                _ => {}
            }
        }

        let section_str = |section: Option<Vec<u8>>, what: &str| {
            section
                .ok_or_else(|| BoardError::Bitfile(format!("missing {} section", what)))
                .map(|b| String::from_utf8_lossy(&b).trim_end_matches('\0').to_string())
        };

        Ok(Bitfile {
            name: section_str(name, "name")?,
            part: section_str(part, "part")?,
            date: section_str(date, "date")?,
            time: section_str(time, "time")?,
            image: image.ok_or_else(|| BoardError::Bitfile("missing image section".into()))?,
        })
    }

    /// Configuration stream padded for the bulk upload. The firmware wants
    /// the unusual `(len + 511 + 512) & !511` length; the tail is zero.
    pub fn padded_image(&self) -> Vec<u8> {
        let padded_len = (self.image.len() + 511 + 512) & !511;
        let mut out = self.image.clone();
        out.resize(padded_len, 0);
        out
    }
}

fn read_section<R: Read>(r: &mut R, len_bytes: usize) -> Result<Vec<u8>, BoardError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf[..len_bytes])?;
    let length = match len_bytes {
        2 => BigEndian::read_u16(&len_buf[..2]) as usize,
        _ => BigEndian::read_u32(&len_buf[..4]) as usize,
    };
    let mut data = vec![0u8; length];
    r.read_exact(&mut data)?;
    Ok(data)
}

/// One claimed ZestSC1 board. All transfers serialize on the internal mutex;
/// every transfer runs with a 1 s timeout.
pub struct ZestBoard {
    handle: Mutex<rusb::DeviceHandle<GlobalContext>>,
}

impl ZestBoard {
    fn claim(device: &rusb::Device<GlobalContext>) -> Result<Self, BoardError> {
        let mut handle = device.open()?;
        handle.set_active_configuration(1)?;
        handle.claim_interface(0)?;
        Ok(ZestBoard { handle: Mutex::new(handle) })
    }

    /// All boards matching the vendor/product id. Boards that cannot be
    /// opened (hot-plug races, permissions) are skipped.
    pub fn enumerate() -> Result<Vec<ZestBoard>, BoardError> {
        let mut boards = Vec::new();
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if desc.vendor_id() != ID_VENDOR || desc.product_id() != ID_PRODUCT {
                continue;
            }
            match ZestBoard::claim(&device) {
                Ok(board) => boards.push(board),
                Err(e) => log::debug!("skipping unclaimable board: {}", e),
            }
        }
        Ok(boards)
    }

    /// Exactly one board with the given serial number; zero matches and
    /// duplicate serials are both rejected.
    pub fn open_by_serial(serial: u32) -> Result<ZestBoard, BoardError> {
        let mut matches = Vec::new();
        for board in ZestBoard::enumerate()? {
            match board.serial_number() {
                Ok(sn) if sn == serial => matches.push(board),
                Ok(_) => {}
                Err(e) => log::debug!("skipping board without readable serial: {}", e),
            }
        }
        match matches.len() {
            0 => Err(BoardError::NotFound(serial)),
            1 => Ok(matches.remove(0)),
            count => Err(BoardError::Ambiguous { serial, count }),
        }
    }

    pub fn read_eeprom(&self, address: u16) -> Result<[u8; 3], BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = [0u8; 3];
        let done = handle.read_control(
            request_in(),
            REQ_READ_EEPROM,
            address,
            0,
            &mut buf,
            TRANSFER_TIMEOUT,
        )?;
        if done != buf.len() {
            return Err(BoardError::Short { want: buf.len(), done });
        }
        Ok(buf)
    }

    pub fn fpga_type(&self) -> Result<u8, BoardError> {
        Ok(self.read_eeprom(EEPROM_FPGA_TYPE)?[2])
    }

    pub fn card_id(&self) -> Result<u8, BoardError> {
        Ok(self.read_eeprom(EEPROM_CARD_ID)?[2])
    }

    pub fn serial_number(&self) -> Result<u32, BoardError> {
        self.read_eeprom_u32(EEPROM_SERIAL_NUMBER)
    }

    pub fn memory_size(&self) -> Result<u32, BoardError> {
        self.read_eeprom_u32(EEPROM_MEMORY_SIZE)
    }

    fn read_eeprom_u32(&self, base: u16) -> Result<u32, BoardError> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_eeprom(base + i as u16)?[2];
        }
        Ok(BigEndian::read_u32(&bytes))
    }

    pub fn firmware_version(&self) -> Result<[u8; 3], BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = [0u8; 3];
        handle.read_control(request_in(), REQ_FIRMWARE, 0, 0, &mut buf, TRANSFER_TIMEOUT)?;
        Ok(buf)
    }

    pub fn identity(&self) -> Result<BoardIdentity, BoardError> {
        Ok(BoardIdentity {
            fpga_type: self.fpga_type()?,
            card_id: self.card_id()?,
            serial_number: self.serial_number()?,
            memory_size: self.memory_size()?,
        })
    }

    /// One control transfer per byte; the firmware acknowledges each write
    /// with a single status byte, so the transfers run IN direction.
    pub fn write_register(&self, index: u16, data: &[u8]) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut ack = [0u8; 1];
        for (i, d) in data.iter().enumerate() {
            handle.read_control(
                request_in(),
                REQ_WRITE_REGISTER,
                index + i as u16,
                *d as u16,
                &mut ack,
                TRANSFER_TIMEOUT,
            )?;
            log::trace!("write_register 0x{:04x} <- 0x{:02x}", index + i as u16, d);
        }
        Ok(())
    }

    /// One control transfer per byte; the datum is the second byte of each
    /// two-byte answer.
    pub fn read_register(&self, index: u16, length: usize) -> Result<Vec<u8>, BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut out = vec![0u8; length];
        let mut buf = [0u8; 2];
        for (i, b) in out.iter_mut().enumerate() {
            let done = handle.read_control(
                request_in(),
                REQ_READ_REGISTER,
                index + i as u16,
                0,
                &mut buf,
                TRANSFER_TIMEOUT,
            )?;
            if done != 2 {
                return Err(BoardError::Short { want: 2, done });
            }
            *b = buf[1];
        }
        log::trace!("read_register 0x{:04x} ({} bytes)", index, length);
        Ok(out)
    }

    pub fn write_data(&self, data: &[u8]) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        let done = handle.write_bulk(EP_WRITE_DATA, data, TRANSFER_TIMEOUT)?;
        if done != data.len() {
            return Err(BoardError::Short { want: data.len(), done });
        }
        Ok(())
    }

    pub fn read_data(&self, length: usize) -> Result<Vec<u8>, BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = vec![0u8; length];
        let done = handle.read_bulk(EP_READ_DATA, &mut buf, TRANSFER_TIMEOUT)?;
        if done != length {
            return Err(BoardError::Short { want: length, done });
        }
        Ok(buf)
    }

    pub fn read_int(&self, length: usize) -> Result<Vec<u8>, BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = vec![0u8; length];
        let done = handle.read_bulk(EP_READ_INT, &mut buf, TRANSFER_TIMEOUT)?;
        buf.truncate(done);
        Ok(buf)
    }

    pub fn set_signal_direction(&self, direction: u16) -> Result<(), BoardError> {
        self.signal_request(REQ_SIGNAL_DIRECTION, direction)?;
        Ok(())
    }

    pub fn set_signal(&self, signal: u16) -> Result<(), BoardError> {
        self.signal_request(REQ_SET_SIGNAL, signal)?;
        Ok(())
    }

    pub fn get_signal(&self) -> Result<u16, BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = [0u8; 2];
        handle.read_control(request_in(), REQ_GET_SIGNAL, 0, 0, &mut buf, TRANSFER_TIMEOUT)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn signal_request(&self, request: u8, value: u16) -> Result<u8, BoardError> {
        let handle = self.handle.lock().unwrap();
        let mut buf = [0u8; 1];
        handle.read_control(request_in(), request, value, 0, &mut buf, TRANSFER_TIMEOUT)?;
        Ok(buf[0])
    }

    /// Hold the 8051 in reset, then release it.
    pub fn reset_8051(&self) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        reset_8051_locked(&handle)
    }

    /// Dummy configuration cycle that stabilizes the first transfer after a
    /// cold plug.
    pub fn open_card(&self) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        reset_8051_locked(&handle)?;
        write_config_locked(&handle, 4096, 4096)?;
        let zeros = vec![0u8; 4096];
        let done = handle.write_bulk(EP_WRITE_DATA, &zeros, TRANSFER_TIMEOUT)?;
        if done != zeros.len() {
            return Err(BoardError::Short { want: zeros.len(), done });
        }
        reset_8051_locked(&handle)?;
        Ok(())
    }

    /// Upload a padded configuration stream to the FPGA.
    pub fn load_bitarray(&self, bitarray: &[u8]) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        reset_8051_locked(&handle)?;

        let length = bitarray.len();
        let value = ((length >> 16) & 0xffff) as u16;
        let index = (length & 0xffff) as u16;
        write_config_locked(&handle, value, index)?;

        let done = handle.write_bulk(EP_WRITE_DATA, bitarray, TRANSFER_TIMEOUT)?;
        if done != length {
            return Err(BoardError::Short { want: length, done });
        }

        let mut status = [0u8; 3];
        handle.read_control(request_in(), REQ_READ_CONFIG, 0, 0, &mut status, TRANSFER_TIMEOUT)?;
        Ok(())
    }

    pub fn load_bitfile(&self, bitfile: &Bitfile) -> Result<(), BoardError> {
        log::info!(
            "Programming FPGA: {} (part {}, built {} {})",
            bitfile.name,
            bitfile.part,
            bitfile.date,
            bitfile.time
        );
        self.load_bitarray(&bitfile.padded_image())
    }

    pub fn close_board(&self) -> Result<(), BoardError> {
        let handle = self.handle.lock().unwrap();
        write_config_locked(&handle, 4096, 4096)?;
        reset_8051_locked(&handle)?;
        Ok(())
    }
}

fn reset_8051_locked(handle: &rusb::DeviceHandle<GlobalContext>) -> Result<(), BoardError> {
    handle.write_control(request_out(), REQ_RESET_8051, VALUE_8051, 0, &[1], TRANSFER_TIMEOUT)?;
    handle.write_control(request_out(), REQ_RESET_8051, VALUE_8051, 0, &[0], TRANSFER_TIMEOUT)?;
    Ok(())
}

fn write_config_locked(
    handle: &rusb::DeviceHandle<GlobalContext>,
    value: u16,
    index: u16,
) -> Result<(), BoardError> {
    let mut buf = [0u8; 2];
    handle.read_control(request_in(), REQ_WRITE_CONFIG, value, index, &mut buf, TRANSFER_TIMEOUT)?;
    Ok(())
}

/// EEPROM identity block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardIdentity {
    pub fpga_type: u8,
    pub card_id: u8,
    pub serial_number: u32,
    pub memory_size: u32,
}

impl fmt::Display for BoardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ZestSC1 card {} (FPGA type {}, serial {}, {} bytes memory)",
            self.card_id, self.fpga_type, self.serial_number, self.memory_size
        )
    }
}

fn request_in() -> u8 {
    rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device)
}

fn request_out() -> u8 {
    rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn section(tag: u8, len_bytes: usize, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        match len_bytes {
            2 => out.extend_from_slice(&(payload.len() as u16).to_be_bytes()),
            _ => out.extend_from_slice(&(payload.len() as u32).to_be_bytes()),
        }
        out.extend_from_slice(payload);
        out
    }

    fn sample_bitfile(image: &[u8]) -> Vec<u8> {
        let mut stream = vec![0x00, 0x09, 0x0f, 0xf0]; // leading junk is skipped
        stream.extend(section(0x61, 2, b"tlu_toplevel.ncd\0"));
        stream.extend(section(0x62, 2, b"3s1000fg320\0"));
        stream.extend(section(0x63, 2, b"2018/06/20\0"));
        stream.extend(section(0x64, 2, b"10:11:12\0"));
        stream.extend(section(0x65, 4, image));
        stream
    }

    #[test]
    fn parses_tagged_sections() {
        let image = vec![0xaa; 777];
        let parsed = Bitfile::parse(&mut Cursor::new(sample_bitfile(&image))).unwrap();
        assert_eq!(parsed.name, "tlu_toplevel.ncd");
        assert_eq!(parsed.part, "3s1000fg320");
        assert_eq!(parsed.date, "2018/06/20");
        assert_eq!(parsed.time, "10:11:12");
        assert_eq!(parsed.image, image);
    }

    #[test]
    fn missing_image_is_an_error() {
        let mut stream = section(0x61, 2, b"x");
        stream.extend(section(0x62, 2, b"x"));
        stream.extend(section(0x63, 2, b"x"));
        stream.extend(section(0x64, 2, b"x"));
        assert!(Bitfile::parse(&mut Cursor::new(stream)).is_err());
    }

    #[test]
    fn padding_formula_and_zero_tail() {
        for len in [1usize, 2, 511, 512, 513, 1024, 4096, 65535] {
            let bitfile = Bitfile {
                name: String::new(),
                part: String::new(),
                date: String::new(),
                time: String::new(),
                image: vec![0x5a; len],
            };
            let padded = bitfile.padded_image();
            assert_eq!(padded.len(), (len + 511 + 512) & !511, "len {}", len);
            assert_eq!(padded.len() % 512, 0);
            assert!(padded.len() >= len);
            assert!(padded[len..].iter().all(|&b| b == 0));
            assert_eq!(&padded[..len], &bitfile.image[..]);
        }
    }
}
