mod cache;
mod helpers;
mod records;
mod worker;

pub(crate) use cache::{cmd_cache_clear, cmd_cache_list, cmd_cache_show};
pub(crate) use records::{cmd_records_add, cmd_records_list, cmd_records_show};
pub(crate) use worker::{cmd_activate, cmd_install, cmd_status, cmd_sync};
