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

#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]

mod errors;
mod io;

pub use errors::SysfsError;
pub use io::kernel_module_loaded;
pub use io::parse_cpu_range;
pub use io::read_string;
pub use io::read_u64;
pub use io::write_value;
pub use io::SysfsRoot;

pub type SysfsResult<T> = Result<T, SysfsError>;
