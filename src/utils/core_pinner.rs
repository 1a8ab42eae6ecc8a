use anyhow::Context;
use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pins the calling thread to `core_id`.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    let cores = available_cores()?;
    if !cores.contains(&core_id) {
        anyhow::bail!("core {core_id} is not available, cores: {cores:?}");
    }
    if !set_for_current(CoreId { id: core_id }) {
        anyhow::bail!("failed to pin core {core_id}");
    }
    Ok(core_id)
}

/// Core ids the OS reports for this process.
pub fn available_cores() -> anyhow::Result<Vec<usize>> {
    let ids = get_core_ids().context("core_affinity::get_core_ids() returned None")?;
    Ok(ids.into_iter().map(|c| c.id).collect())
}
