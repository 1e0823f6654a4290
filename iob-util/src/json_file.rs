// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use clap;
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use serde_json;
use std::default::Default;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

/// Reads a json file which may carry `//` or `#` comment lines. Comment
/// lines before the body are returned as the preamble.
fn read_json<P: AsRef<Path>>(path: P) -> Result<(String, String)> {
    let buf = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Reading {:?}", path.as_ref()))?;

    let mut preamble = String::new();
    let mut body = String::new();
    let mut seen_body = false;

    for line in buf.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("#") {
            if !seen_body {
                preamble = preamble + line + "\n";
            }
            body = body + "\n";
        } else {
            seen_body = true;
            body = body + line + "\n"
        }
    }
    Ok((preamble, body))
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (_, body) = read_json(&path)?;
        Ok(serde_json::from_str::<Self>(&body)
            .with_context(|| format!("Parsing {:?}", path.as_ref()))?)
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    /// Writes to `PATH.staging` and renames over `PATH` so that readers
    /// never see a half written file.
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut staging = path.to_path_buf().into_os_string();
        staging.push(".staging");
        let staging = PathBuf::from(staging);

        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .with_context(|| format!("Creating {:?}", &staging))?;
        f.write_all(self.as_json()?.as_ref())?;
        f.sync_data()?;
        fs::rename(&staging, path)
            .with_context(|| format!("Renaming {:?} to {:?}", &staging, path))?;
        Ok(())
    }
}

fn maybe_create_dfl<T, P>(path_in: P) -> Result<bool>
where
    T: JsonSave + Default,
    P: AsRef<Path>,
{
    let path = path_in.as_ref();

    if let Some(parent) = path.parent() {
        if parent.as_os_str().len() > 0 {
            fs::create_dir_all(&parent)?;
        }
    }

    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut f) => {
            let data: T = Default::default();
            f.write_all(data.as_json()?.as_ref())?;
            Ok(true)
        }
        Err(e) => match e.kind() {
            io::ErrorKind::AlreadyExists => Ok(false),
            _ => Err(e.into()),
        },
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave + Default> Default for JsonConfigFile<T> {
    fn default() -> Self {
        Self {
            path: None,
            data: Default::default(),
        }
    }
}

impl<T: JsonLoad + JsonSave + Default> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = AsRef::<Path>::as_ref(&path_in);

        let mut data = T::load(&path)?;
        data.loaded()?;

        Ok(Self {
            path: Some(PathBuf::from(path)),
            data,
        })
    }

    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = AsRef::<Path>::as_ref(&path_in);

                if maybe_create_dfl::<T, _>(&path)? {
                    info!("cfg: Created {:?}", &path);
                }

                Self::load(path)
            }
            None => {
                let mut data: T = Default::default();
                data.loaded()?;
                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_deref() {
            Some(path) => self.data.save(&path),
            None => Ok(()),
        }
    }
}

/// Command line arguments which can be persisted to and loaded from a
/// json args file. Command line flags override what's in the file.
pub trait JsonArgs
where
    Self: JsonLoad + JsonSave + Default,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Apply `matches` on top of the loaded values. Returns whether
    /// anything that should be persisted changed.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<Self>, bool)>;
    fn save_args(args_file: &JsonConfigFile<Self>) -> Result<()>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args").as_ref())?;
        let updated = args_file.data.process_cmdline(&matches)?;

        Ok((args_file, updated))
    }

    fn save_args(args_file: &JsonConfigFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_deref() {
            info!("Updating command line arguments file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }
}
