//! Seeding engine
//!
//! A single actor task owns the announce loop. Handles talk to it over a
//! command channel and read status straight from the shared registry.

pub mod actor;
pub mod commands;
pub mod core;
pub mod handle;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use actor::spawn_seeding_engine;
pub use commands::SeedingCommand;
pub use handle::SeedingEngineHandle;

use crate::announcer::Announcer;
use crate::torrent::InfoHash;

/// Active announcers, read-mostly with one lock per announcer.
pub type AnnouncerRegistry = Arc<RwLock<HashMap<InfoHash, Arc<Mutex<Announcer>>>>>;
