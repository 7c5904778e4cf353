//! Expansion of a campaign config into its task list.

use crate::config::CampaignConfig;
use crate::core::naming::RunLayout;
use crate::core::task::{Task, TaskKind};

/// Build every task of a run, in variant-major, energy-minor config order.
///
/// Each simulation is followed directly by its reconstruction when
/// reconstruction is enabled. Pure: the same config and layout always
/// produce the same list.
pub fn expand(cfg: &CampaignConfig, layout: &RunLayout) -> Vec<Task> {
    let per_chain = if cfg.enable_reconstruction { 2 } else { 1 };
    let mut tasks = Vec::with_capacity(cfg.variants.len() * cfg.energies.len() * per_chain);

    for variant in &cfg.variants {
        let vk = variant.key();
        for energy in &cfg.energies {
            let ek = energy.key();
            let sim_output = layout.artifact_path(TaskKind::Simulate, &vk, &ek);
            let sim = Task::new(
                TaskKind::Simulate,
                &vk,
                energy,
                energy.input.clone(),
                sim_output.clone(),
                layout.log_path(TaskKind::Simulate, &vk, &ek),
            )
            .in_work_dir(layout.work_dir(TaskKind::Simulate, &vk, &ek));
            let sim_id = sim.id.clone();
            tasks.push(sim);

            if cfg.enable_reconstruction {
                let recon = Task::new(
                    TaskKind::Reconstruct,
                    &vk,
                    energy,
                    sim_output,
                    layout.artifact_path(TaskKind::Reconstruct, &vk, &ek),
                    layout.log_path(TaskKind::Reconstruct, &vk, &ek),
                )
                .in_work_dir(layout.work_dir(TaskKind::Reconstruct, &vk, &ek))
                .depending_on(sim_id);
                tasks.push(recon);
            }
        }
    }

    tasks
}
