//! Firmware (BIOS) short-circuit.
//!
//! Before classification the pipeline asks a [`FirmwareRegistry`] whether a
//! file name belongs to a known firmware image. Matches are never extracted;
//! they are published on the dedicated firmware stream instead.

use std::collections::HashSet;
use std::fmt;

/// Lookup of firmware file names, owned by whatever maintains the BIOS
/// database.
pub trait FirmwareRegistry: Send + Sync + fmt::Debug {
    fn is_known_firmware(&self, file_name: &str) -> bool;
}

/// Registry that knows no firmware; every file goes through import.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFirmware;

impl FirmwareRegistry for NoFirmware {
    fn is_known_firmware(&self, _file_name: &str) -> bool {
        false
    }
}

/// Fixed, case-insensitive set of firmware names.
#[derive(Debug, Default, Clone)]
pub struct StaticFirmwareList {
    names: HashSet<String>,
}

impl StaticFirmwareList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|name| name.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FirmwareRegistry for StaticFirmwareList {
    fn is_known_firmware(&self, file_name: &str) -> bool {
        self.names.contains(&file_name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_list_ignores_case() {
        let list = StaticFirmwareList::new(["SCPH1001.BIN", "gba_bios.bin"]);
        assert!(list.is_known_firmware("scph1001.bin"));
        assert!(list.is_known_firmware("GBA_BIOS.BIN"));
        assert!(!list.is_known_firmware("game.bin"));
        assert!(!NoFirmware.is_known_firmware("scph1001.bin"));
    }
}
