//! One-time bring-up of the storage image.
//!
//! Checks the device, converts a legacy image if the device has never
//! been stamped with the current signature, stamps it, and loads the
//! image into the mirror. Every device failure in here is returned to the
//! caller, which treats it as fatal.
//!
//! Ordering on the device is chosen so that a power cut at any point is
//! retried cleanly on the next boot: the migrated image is synced before
//! the signature is stamped, and the legacy image is only archived once
//! the signature is durable.

use nvs_device::{LegacyStore, OpenMode, PersistentDevice, read_exact_at, write_all_at};
use nvs_error::{NvsError, Result};
use nvs_types::{SIGNATURE_LEN, Signature, StorageGeometry};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What bring-up found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitReport {
    /// Signature matched and there was no legacy image.
    Current,
    /// Fresh device without a legacy image; the signature was stamped.
    Stamped,
    /// The legacy image was copied to the device and the signature stamped.
    Migrated { archived: bool },
    /// Signature matched but a legacy image was still present.
    AlreadyMigrated { archived: bool },
}

/// Read-only view of the device and legacy store, taken without
/// initializing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProbe {
    pub device_present: bool,
    /// Signature field as found, when the device could be read.
    pub signature: Option<Signature>,
    pub signature_valid: bool,
    pub legacy_present: bool,
}

pub(crate) struct Migration<'a> {
    pub device: &'a dyn PersistentDevice,
    pub legacy: Option<&'a dyn LegacyStore>,
    pub geometry: StorageGeometry,
    pub signature: Signature,
    pub signature_offset: u64,
    pub archive_legacy: bool,
}

impl Migration<'_> {
    /// Bring the device to the current format and load it into `image`.
    pub fn run(&self, image: &mut [u8]) -> Result<InitReport> {
        debug_assert_eq!(image.len(), self.geometry.storage_size());
        if !self.device.exists() {
            return Err(NvsError::DeviceMissing(self.device.describe()));
        }

        let found = self.read_signature()?;
        let good_signature = found == self.signature;
        debug!(
            device = %self.device.describe(),
            found = %found,
            expected = %self.signature,
            "read format signature"
        );

        let legacy = self.legacy.filter(|legacy| legacy.exists());
        let mut migrated = false;
        if let Some(legacy) = legacy {
            if !good_signature {
                self.upgrade_from(legacy, image)?;
                migrated = true;
            }
        }

        if !good_signature {
            self.write_signature()?;
        }

        let archived = match legacy {
            Some(legacy) if self.archive_legacy => archive(legacy),
            _ => false,
        };

        self.load_image(image)?;

        let report = match (legacy.is_some(), migrated, good_signature) {
            (true, true, _) => InitReport::Migrated { archived },
            (true, false, _) => InitReport::AlreadyMigrated { archived },
            (false, _, true) => InitReport::Current,
            (false, _, false) => InitReport::Stamped,
        };
        Ok(report)
    }

    /// Inspect without writing. Read errors on a present device are returned.
    pub fn probe(&self) -> Result<DeviceProbe> {
        let device_present = self.device.exists();
        let signature = if device_present {
            Some(self.read_signature()?)
        } else {
            None
        };
        Ok(DeviceProbe {
            device_present,
            signature,
            signature_valid: signature == Some(self.signature),
            legacy_present: self.legacy.is_some_and(|legacy| legacy.exists()),
        })
    }

    fn read_signature(&self) -> Result<Signature> {
        let mut handle = self.device.open(OpenMode::ReadOnly)?;
        let mut raw = [0_u8; SIGNATURE_LEN];
        read_exact_at(handle.as_mut(), self.signature_offset, &mut raw)?;
        Ok(Signature::from_bytes(raw))
    }

    fn write_signature(&self) -> Result<()> {
        let mut handle = self.device.open(OpenMode::WriteOnly)?;
        write_all_at(
            handle.as_mut(),
            self.signature_offset,
            &self.signature.to_bytes(),
        )?;
        handle.sync()?;
        info!(
            device = %self.device.describe(),
            signature = %self.signature,
            offset = self.signature_offset,
            "stamped format signature"
        );
        Ok(())
    }

    /// Copy the whole legacy image to the device, using `image` as the
    /// transfer buffer.
    fn upgrade_from(&self, legacy: &dyn LegacyStore, image: &mut [u8]) -> Result<()> {
        let mut source = legacy.open()?;
        read_exact_at(source.as_mut(), 0, image)?;
        drop(source);

        let mut target = self.device.open(OpenMode::WriteOnly)?;
        write_all_at(target.as_mut(), 0, image)?;
        target.sync()?;
        info!(
            legacy = %legacy.describe(),
            device = %self.device.describe(),
            bytes = image.len(),
            "migrated legacy storage image"
        );
        Ok(())
    }

    fn load_image(&self, image: &mut [u8]) -> Result<()> {
        let mut handle = self.device.open(OpenMode::ReadOnly)?;
        read_exact_at(handle.as_mut(), 0, image)
    }
}

/// Archive the legacy image. Failure only costs us a stale recovery copy,
/// so it is logged and otherwise ignored.
fn archive(legacy: &dyn LegacyStore) -> bool {
    match legacy.archive() {
        Ok(()) => {
            info!(legacy = %legacy.describe(), "archived legacy storage image");
            true
        }
        Err(err) => {
            warn!(legacy = %legacy.describe(), error = %err, "failed to archive legacy storage image");
            false
        }
    }
}
