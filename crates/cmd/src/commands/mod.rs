// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub mod clear_cache;
pub mod describe;
pub mod query;
pub mod sql;

pub use clear_cache::clear_cache_command;
pub use describe::describe_command;
pub use query::query_command;
pub use sql::sql_command;
