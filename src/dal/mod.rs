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

//! Data access layer for the `pgagent` schema.
//!
//! The schema is owned by an external installer; the agent only reads and
//! writes the rows listed here, and never alters their shape. Keeping the
//! SQL in one place leaves the executor and scheduler free of statement
//! text.

pub mod agent;
pub mod jobs;

pub use agent::AgentDal;
pub use jobs::JobDal;
