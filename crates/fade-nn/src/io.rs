// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout shared by the JSON and bincode codecs. Parameters are kept
/// sorted so two saves of the same weights are byte-identical.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    version: u32,
    parameters: BTreeMap<String, Tensor>,
}

impl ModuleSnapshot {
    fn from_state(state: &HashMap<String, Tensor>) -> Self {
        ModuleSnapshot {
            version: SNAPSHOT_VERSION,
            parameters: state
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.clone()))
                .collect(),
        }
    }

    fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        if self.version != SNAPSHOT_VERSION {
            return Err(TensorError::SerializationError {
                message: format!("unsupported snapshot version {}", self.version),
            });
        }
        Ok(self.parameters.into_iter().collect())
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes to a sibling file first and renames it over `path`, so readers
/// never observe a half-written snapshot.
fn write_atomically<P, F>(path: P, encode: F) -> PureResult<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> PureResult<()>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let staging = staging_path(path);
    let file = File::create(&staging).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    encode(&mut writer)?;
    writer.flush().map_err(io_error)?;
    drop(writer);
    fs::rename(&staging, path).map_err(io_error)
}

fn read_json(path: &Path) -> PureResult<ModuleSnapshot> {
    let file = File::open(path).map_err(io_error)?;
    serde_json::from_reader(BufReader::new(file)).map_err(serde_error)
}

fn read_bincode(path: &Path) -> PureResult<ModuleSnapshot> {
    let file = File::open(path).map_err(io_error)?;
    bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)
}

pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = ModuleSnapshot::from_state(state);
    write_atomically(path, |writer| {
        serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)
    })
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    read_json(path.as_ref())?.into_state()
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = ModuleSnapshot::from_state(state);
    write_atomically(path, |writer| {
        bincode::serialize_into(writer, &snapshot).map_err(serde_error)
    })
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    read_bincode(path.as_ref())?.into_state()
}
