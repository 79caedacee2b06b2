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

use std::path::PathBuf;

use crate::defaults::default_cpu_path;
use crate::defaults::default_module_path;

/// Filesystem locations and discovery overrides the host is built against.
/// The defaults target a real machine; tests point `cpu_path` at a fake
/// sysfs tree instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibConfig {
    /// Base of the kernel cpu interface.
    pub cpu_path: PathBuf,
    /// Line oriented listing of loaded kernel modules.
    pub module_path: PathBuf,
    /// Overrides the cpu count detected from the `online` file.
    pub cpu_count: Option<u32>,
}

impl Default for LibConfig {
    fn default() -> Self {
        Self {
            cpu_path: default_cpu_path(),
            module_path: default_module_path(),
            cpu_count: None,
        }
    }
}
