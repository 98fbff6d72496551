use std::fmt;

/// Execution statistics for the block-pool / dispatcher pipeline.
///
/// Purely observational — never affects control flow. Mirrors the
/// hit/miss and chain-patch counters an execution engine normally
/// tracks, scaled down to this translator's single-threaded dispatch
/// loop. Printed when the `DBT_STATS` environment variable is set.
#[derive(Default)]
pub struct DbtStats {
    pub block_hit: u64,
    pub block_miss: u64,
    pub flush_count: u64,
    pub direct_chain_patched: u64,
    pub indirect_dispatch: u64,
}

impl fmt::Display for DbtStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_lookup = self.block_hit + self.block_miss;
        writeln!(f, "=== DBT stats ===")?;
        writeln!(
            f,
            "block hit:          {} ({:.1}%)",
            self.block_hit,
            pct(self.block_hit, total_lookup)
        )?;
        writeln!(f, "block miss:         {}", self.block_miss)?;
        writeln!(f, "flushes:            {}", self.flush_count)?;
        writeln!(f, "direct chains:      {}", self.direct_chain_patched)?;
        writeln!(f, "indirect dispatches:{}", self.indirect_dispatch)?;
        Ok(())
    }
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64 * 100.0
    }
}

/// Whether `DBT_STATS` is set in the environment — checked once at
/// startup by the harness, not on the hot path.
pub fn stats_enabled() -> bool {
    std::env::var_os("DBT_STATS").is_some()
}
