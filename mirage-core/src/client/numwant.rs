//! Number of peers requested per announce

use super::TemplateError;
use crate::tracker::AnnounceEvent;

/// Selects `numwant` or `numwantOnStop` depending on the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumwantProvider {
    numwant: u32,
    numwant_on_stop: u32,
}

impl NumwantProvider {
    /// # Errors
    /// - `TemplateError::InvalidDescriptor` - `numwant < 1` or `numwant_on_stop < 0`
    pub fn new(numwant: i64, numwant_on_stop: i64) -> Result<Self, TemplateError> {
        let numwant = u32::try_from(numwant)
            .ok()
            .filter(|value| *value >= 1)
            .ok_or_else(|| TemplateError::InvalidDescriptor {
                reason: format!("numwant must be at least 1, got {numwant}"),
            })?;
        let numwant_on_stop =
            u32::try_from(numwant_on_stop).map_err(|_| TemplateError::InvalidDescriptor {
                reason: format!("numwantOnStop must be at least 0, got {numwant_on_stop}"),
            })?;

        Ok(Self {
            numwant,
            numwant_on_stop,
        })
    }

    pub fn get(&self, event: AnnounceEvent) -> u32 {
        match event {
            AnnounceEvent::Stopped => self.numwant_on_stop,
            AnnounceEvent::Started | AnnounceEvent::None => self.numwant,
        }
    }
}
