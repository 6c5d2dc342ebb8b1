/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Database connection management: connection-string normalization, the
//! session type, and the process-wide pool.

pub mod conninfo;
pub mod pool;
pub mod session;

pub use conninfo::ConnectionInfo;
pub use pool::{ConnectionPool, PooledSession};
pub use session::{Session, SimpleRows};
