//! Run statistics line for announcements.

/// Compact runtime formatting: `850ms`, `45s`, `5m12s`, `1h02m`.
pub fn format_runtime_compact(runtime_ms: i64) -> String {
    if runtime_ms < 0 {
        return "n/a".to_string();
    }
    if runtime_ms < 1_000 {
        return format!("{runtime_ms}ms");
    }

    let total_seconds = runtime_ms / 1_000;
    let seconds = total_seconds % 60;
    let minutes = (total_seconds / 60) % 60;
    let hours = total_seconds / 3_600;

    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Gathered statistics for one child run. Missing pieces render as `n/a`.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub runtime_ms: Option<i64>,
    pub cost_usd: Option<f64>,
    pub session_key: String,
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
}

impl RunStats {
    pub fn line(&self) -> String {
        let runtime = self
            .runtime_ms
            .map(format_runtime_compact)
            .unwrap_or_else(|| "n/a".to_string());

        let tokens = match (self.input_tokens, self.output_tokens) {
            (Some(input), Some(output)) => {
                format!("{} (in {} / out {})", input + output, input, output)
            }
            _ => "n/a".to_string(),
        };

        let cost = self
            .cost_usd
            .map(|value| format!("${value:.4}"))
            .unwrap_or_else(|| "$n/a".to_string());

        format!(
            "runtime {runtime} • tokens {tokens} • est {cost} • sessionKey {} • sessionId {} • transcript {}",
            if self.session_key.is_empty() {
                "n/a"
            } else {
                &self.session_key
            },
            self.session_id.as_deref().unwrap_or("n/a"),
            self.transcript_path.as_deref().unwrap_or("n/a"),
        )
    }
}
