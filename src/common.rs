pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Once,
};
pub use tch::{
    kind::FLOAT_CPU,
    nn,
    Device, Kind, Tensor,
};
pub use tracing::{debug, info, warn};
