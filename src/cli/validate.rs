use anyhow::Result;
use std::path::Path;

use super::config::Config;
use super::scenario::RequestScenario;
use crate::engine::TestPlan;
use crate::utils::format_duration;

/// Validate a plan file without running it.
/// Checks for:
/// - YAML/JSON syntax errors
/// - Schedule and duration validity
/// - Threshold expressions
/// - Request definitions
pub fn run_validate(plan_path: &Path, overrides: Option<Config>) -> Result<()> {
    println!("Validating {}...", plan_path.display());

    let mut config = match Config::load(plan_path) {
        Ok(c) => c,
        Err(e) => {
            println!("  ✗ Plan file invalid: {:#}", e);
            return Err(e);
        }
    };
    println!("  ✓ Plan file parsed");
    if let Some(o) = overrides {
        config.merge(o);
    }

    let plan = match TestPlan::try_from(&config) {
        Ok(p) => p,
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    };
    println!(
        "  ✓ Schedule: {} stage(s), {} total, peak {} VUs",
        plan.schedule.stages().len(),
        format_duration(plan.schedule.total_duration()),
        plan.schedule.peak()
    );
    if !plan.thresholds.is_empty() {
        println!("  ✓ Thresholds: {} expression(s)", plan.thresholds.len());
    }

    match RequestScenario::from_config(&config) {
        Ok(s) => println!("  ✓ Requests: {}", s.len()),
        Err(e) => {
            println!("  ✗ {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
