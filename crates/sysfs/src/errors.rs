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

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SysfsError {
    #[error("reading '{path}' there is an error: {io_error}")]
    Read {
        path: PathBuf,
        #[source]
        io_error: std::io::Error,
    },

    #[error("writing '{value}' to '{path}' there is an error: {io_error}")]
    Write {
        path: PathBuf,
        value: String,
        #[source]
        io_error: std::io::Error,
    },

    #[error("'{path}' does not contain an unsigned integer, got {content:?}")]
    Parse { path: PathBuf, content: String },
}

impl SysfsError {
    pub(crate) fn read(path: PathBuf, io_error: std::io::Error) -> Self {
        Self::Read { path, io_error }
    }

    pub(crate) fn write(path: PathBuf, value: String, io_error: std::io::Error) -> Self {
        Self::Write {
            path,
            value,
            io_error,
        }
    }

    pub(crate) fn parse(path: PathBuf, content: String) -> Self {
        Self::Parse { path, content }
    }

    /// The path of the sysfs attribute the failed operation touched.
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Read { path, .. } => path,
            Self::Write { path, .. } => path,
            Self::Parse { path, .. } => path,
        }
    }
}
