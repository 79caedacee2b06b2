/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt::Display;
use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use cpm_shared::CpuId;

use crate::errors::SysfsError;
use crate::SysfsResult;

/// Access to the kernel cpu interface rooted at a configurable base path,
/// `/sys/devices/system/cpu` on a real machine.
#[derive(Clone, Debug)]
pub struct SysfsRoot {
    base: PathBuf,
}

impl SysfsRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of a file directly under the base, e.g. `online`.
    pub fn file(&self, property: &str) -> PathBuf {
        self.base.join(property)
    }

    /// Path of a property file within the `cpu<N>` subdirectory.
    pub fn cpu_file(&self, cpu: CpuId, property: &str) -> PathBuf {
        self.base.join(format!("cpu{cpu}")).join(property)
    }

    pub fn read_string(&self, property: &str) -> SysfsResult<String> {
        read_string(&self.file(property))
    }

    pub fn read_u64(&self, property: &str) -> SysfsResult<u64> {
        read_u64(&self.file(property))
    }

    pub fn write_value<T: Display>(&self, property: &str, value: T) -> SysfsResult<()> {
        write_value(&self.file(property), value)
    }

    pub fn read_cpu_string(&self, cpu: CpuId, property: &str) -> SysfsResult<String> {
        read_string(&self.cpu_file(cpu, property))
    }

    pub fn read_cpu_u64(&self, cpu: CpuId, property: &str) -> SysfsResult<u64> {
        read_u64(&self.cpu_file(cpu, property))
    }

    pub fn write_cpu_value<T: Display>(
        &self,
        cpu: CpuId,
        property: &str,
        value: T,
    ) -> SysfsResult<()> {
        write_value(&self.cpu_file(cpu, property), value)
    }

    /// Number of online CPUs according to the `online` range file.
    /// Returns `None` when the file is absent or not a `first-last` range.
    pub fn online_cpu_count(&self) -> Option<u32> {
        let raw = self.read_string("online").ok()?;
        parse_cpu_range(&raw)
    }
}

/// Reads a sysfs attribute as a string, tolerating the trailing newline
/// the kernel appends.
pub fn read_string(path: &Path) -> SysfsResult<String> {
    let raw = fs::read_to_string(path).map_err(|error| SysfsError::read(path.to_path_buf(), error))?;
    let value = raw.strip_suffix('\n').unwrap_or(&raw);
    Ok(value.to_string())
}

/// Reads a sysfs attribute and parses it as an unsigned decimal integer.
pub fn read_u64(path: &Path) -> SysfsResult<u64> {
    let value = read_string(path)?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| SysfsError::parse(path.to_path_buf(), value))
}

/// Writes a value as ASCII without a trailing newline.
pub fn write_value<T: Display>(path: &Path, value: T) -> SysfsResult<()> {
    let rendered = value.to_string();
    fs::write(path, rendered.as_bytes())
        .map_err(|error| SysfsError::write(path.to_path_buf(), rendered.clone(), error))
}

/// Parses an `a-b` cpu range expression into the number of CPUs it covers.
pub fn parse_cpu_range(text: &str) -> Option<u32> {
    let (first, last) = text.trim().split_once('-')?;
    let first = first.parse::<u32>().ok()?;
    let last = last.parse::<u32>().ok()?;
    last.checked_sub(first).map(|span| span + 1)
}

/// Checks whether a kernel module is listed in the line oriented modules
/// file, `/proc/modules` on a real machine. A module counts as loaded when
/// any line contains its name.
pub fn kernel_module_loaded(modules_path: &Path, module: &str) -> bool {
    let Ok(file) = File::open(modules_path) else {
        return false;
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .any(|line| line.contains(module))
}
