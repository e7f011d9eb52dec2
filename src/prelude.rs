pub use crate::core::reading::{Reading, Status};
pub use crate::logging::Log;
pub use anyhow::{anyhow, Context as _, Error};
pub use chrono::prelude::*;
pub use crossbeam_channel::{Receiver, Sender};
pub use log::{debug, error, info, warn};
pub use serde::{Deserialize, Serialize};
pub use std::sync::{Arc, Mutex};

pub type Result<T = ()> = std::result::Result<T, Error>;
