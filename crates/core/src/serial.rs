//! Serial registry: derive instance serials from durable volume metadata.
//!
//! Serials are the only piece of identity that survives the loss of the
//! controller's own status record, so everything here is a pure function over
//! metadata that has already been fetched. A single unreadable serial aborts
//! the whole computation: a miscounted highest serial would later hand out a
//! name that is already taken.

use crate::config;
use crate::model::{InstanceRole, ObjectMeta};
use thiserror::Error;

/// Identity metadata on a volume could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("object '{name}' is missing the {annotation} annotation", annotation = config::SERIAL_ANNOTATION)]
    Missing { name: String },
    #[error("object '{name}' has malformed serial {value:?}")]
    Malformed { name: String, value: String },
}

/// Parse the serial annotation of a single object.
///
/// Serials are strictly positive; `0` is reserved for "unset" in the cluster
/// status and is rejected as malformed.
pub fn parse_serial(meta: &ObjectMeta) -> Result<u32, SerialError> {
    let raw = meta
        .annotation(config::SERIAL_ANNOTATION)
        .ok_or_else(|| SerialError::Missing {
            name: meta.name.clone(),
        })?;
    match raw.trim().parse::<u32>() {
        Ok(serial) if serial > 0 => Ok(serial),
        _ => Err(SerialError::Malformed {
            name: meta.name.clone(),
            value: raw.to_string(),
        }),
    }
}

/// Result of reducing a set of volumes to cluster bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialSummary {
    /// Maximum serial across all volumes.
    pub highest: u32,
    /// Serial of the volume labelled primary, or 0 when none is.
    pub primary: u32,
}

impl SerialSummary {
    /// The serial to designate as primary, falling back to the highest one
    /// when no volume claims the primary role.
    pub fn primary_or_highest(&self) -> u32 {
        if self.primary == 0 {
            self.highest
        } else {
            self.primary
        }
    }
}

/// Compute the highest serial and the primary serial over `metas`.
///
/// When several volumes claim the primary role the highest serial among them
/// wins, independent of the order the volumes were listed in.
pub fn reduce_serials<'a, I>(metas: I) -> Result<SerialSummary, SerialError>
where
    I: IntoIterator<Item = &'a ObjectMeta>,
{
    let mut summary = SerialSummary::default();
    for meta in metas {
        let serial = parse_serial(meta)?;
        summary.highest = summary.highest.max(serial);
        let is_primary = meta
            .label(config::ROLE_LABEL)
            .and_then(InstanceRole::from_label)
            == Some(InstanceRole::Primary);
        if is_primary {
            summary.primary = summary.primary.max(serial);
        }
    }
    Ok(summary)
}
