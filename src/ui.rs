//! Terminal output for the demo: a progress bar over checklist runs and a colored
//! summary.

use std::time::Duration;

use checkflow::store::{Checklist, PhaseResults};
use checkflow::worker::StatsSnapshot;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

pub struct DemoProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl DemoProgress {
    /// Starts a bar that completes after `runs` root jobs reached a terminal state.
    pub fn start(runs: u64) -> Self {
        let pb = ProgressBar::new(runs);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} runs  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, stats: &StatsSnapshot) {
        self.pb.set_position(stats.runs_succeeded + stats.runs_failed + stats.abandoned);
        self.pb.set_message(format!(
            "{} deliveries, {} modules, {} retries",
            stats.deliveries, stats.modules_done, stats.retries
        ));
    }

    pub fn finish(&self, stats: &StatsSnapshot) {
        self.pb.finish_and_clear();
        println!(
            "  {} {} runs succeeded",
            self.green.apply_to("✓"),
            stats.runs_succeeded
        );
        if stats.runs_failed > 0 {
            println!("  {} {} runs failed", self.red.apply_to("✗"), stats.runs_failed);
        }
        if stats.abandoned > 0 {
            println!("  {} {} jobs abandoned", self.yellow.apply_to("!"), stats.abandoned);
        }
        println!(
            "  {} modules run, {} deliveries, {} retries, {} escalations, {} dropped",
            stats.modules_done, stats.deliveries, stats.retries, stats.escalations, stats.dropped
        );
    }

    /// One line per checklist with its run timestamps, plus module errors by phase.
    pub fn print_checklists(&self, checklists: &[Checklist], results: &[PhaseResults]) {
        println!();
        for checklist in checklists {
            let style = if checklist.is_idle() { &self.green } else { &self.yellow };
            println!(
                "  {} {} ({}) last_run={} last_completed={} next_run={}",
                style.apply_to("●"),
                checklist.id,
                checklist.organization_id,
                checklist.last_run,
                checklist.last_completed,
                checklist.next_run
            );
            for phase in results
                .iter()
                .filter(|r| r.checklist_id == checklist.id && r.created_at == checklist.last_run)
            {
                for (module, error) in phase.errors() {
                    println!("      {} {}/{module}: {error}", self.red.apply_to("✗"), phase.phase);
                }
            }
        }
    }
}
