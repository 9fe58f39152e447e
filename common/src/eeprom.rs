use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to commit eeprom image: {0}")]
    Commit(String),
}

/// Byte-addressable non-volatile memory.
///
/// Offsets outside `0..capacity()` are a programming error and panic.
/// Media that buffer writes in RAM (flash emulation, NVS blobs, files) persist
/// them in `commit`.
pub trait Eeprom {
    fn capacity(&self) -> usize;

    fn read_byte(&self, offset: usize) -> u8;

    fn write_byte(&mut self, offset: usize, value: u8);

    fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl<E: Eeprom + ?Sized> Eeprom for &mut E {
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn read_byte(&self, offset: usize) -> u8 {
        (**self).read_byte(offset)
    }

    fn write_byte(&mut self, offset: usize, value: u8) {
        (**self).write_byte(offset, value)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        (**self).commit()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEeprom {
    bytes: Vec<u8>,
    dirty: bool,
}

impl MemoryEeprom {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            dirty: false,
        }
    }

    /// Wraps an existing image, zero-extending or cutting it to `capacity`.
    pub fn from_image(mut bytes: Vec<u8>, capacity: usize) -> Self {
        bytes.resize(capacity, 0);
        Self {
            bytes,
            dirty: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Eeprom for MemoryEeprom {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    fn write_byte(&mut self, offset: usize, value: u8) {
        if self.bytes[offset] != value {
            self.bytes[offset] = value;
            self.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_is_resized_to_capacity() {
        let eeprom = MemoryEeprom::from_image(vec![1, 2, 3], 5);
        assert_eq!(eeprom.as_bytes(), &[1, 2, 3, 0, 0]);

        let eeprom = MemoryEeprom::from_image(vec![1, 2, 3], 2);
        assert_eq!(eeprom.as_bytes(), &[1, 2]);
    }

    #[test]
    fn only_changed_bytes_mark_dirty() {
        let mut eeprom = MemoryEeprom::new(4);
        eeprom.write_byte(0, 0);
        assert!(!eeprom.is_dirty());

        eeprom.write_byte(0, 7);
        assert!(eeprom.is_dirty());
        assert_eq!(eeprom.read_byte(0), 7);

        eeprom.mark_clean();
        assert!(!eeprom.is_dirty());
    }

    #[test]
    #[should_panic]
    fn out_of_range_read_panics() {
        let eeprom = MemoryEeprom::new(4);
        eeprom.read_byte(4);
    }
}
