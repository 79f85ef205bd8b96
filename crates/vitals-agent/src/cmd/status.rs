use std::process::ExitCode;

use vitals_agent::health::HealthReport;
use vitals_agent::{AgentConfig, AgentResult};

/// Print the last status written by a running agent.
///
/// Exit code 0 when healthy, 2 when degraded, 1 when no status exists.
pub fn run_status(config: &AgentConfig) -> AgentResult<ExitCode> {
    let path = config.paths().status();
    let report = match HealthReport::load(&path) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("no status at {} (agent never ran?)", path.display());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    println!("device:   {}", report.device_id);
    println!("updated:  {}", report.updated_at.to_rfc3339());
    println!("degraded: {}", report.degraded);
    println!(
        "ping:     {} consecutive failure(s){}",
        report.ping.consecutive_failures,
        last_error(report.ping.last_error.as_deref())
    );
    for (category, upload) in &report.uploads {
        println!(
            "upload {category}: {} consecutive failure(s), {} rejected batch(es){}",
            upload.consecutive_failures,
            upload.rejected_batches,
            last_error(upload.last_error.as_deref())
        );
    }
    for buffer in &report.buffers {
        println!(
            "buffer {}: {}/{} pending, committed through {}, {} dropped",
            buffer.category,
            buffer.pending,
            buffer.capacity,
            buffer.committed_through,
            buffer.dropped
        );
    }

    Ok(if report.degraded {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn last_error(error: Option<&str>) -> String {
    error.map(|e| format!(" (last error: {e})")).unwrap_or_default()
}
