use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use proposal_flow::calendar::{BusinessCalendar, DeadlineCalculator};

use super::{load_config, Command};

pub struct DeadlineCommand {
    pub start: Option<DateTime<Utc>>,
    pub days: Option<u32>,
    pub cutoff: Option<u32>,
}

impl Command for DeadlineCommand {
    async fn execute(&self) -> Result<()> {
        let config = load_config()?;
        let calendar = BusinessCalendar::new(
            config.calendar.utc_offset_hours,
            config.calendar.holidays.iter().copied(),
        );
        let offset = FixedOffset::east_opt(config.calendar.utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("Invalid UTC offset in configuration"))?;

        let start = self.start.unwrap_or_else(Utc::now);
        let days = self.days.unwrap_or(config.sla.business_days);
        let cutoff = self.cutoff.unwrap_or(config.sla.cutoff_hour);
        if cutoff > 23 {
            anyhow::bail!("Cutoff hour must be between 0 and 23, got {cutoff}");
        }

        let deadline = calendar.deadline_with_cutoff(start, days, cutoff);

        println!("⏰ SLA DEADLINE:");
        println!("   Start:    {}", start.with_timezone(&offset).to_rfc3339());
        println!("   Window:   {days} business days, cutoff {cutoff:02}:00");
        println!("   Deadline: {}", deadline.with_timezone(&offset).to_rfc3339());
        println!("   UTC:      {}", deadline.to_rfc3339());
        Ok(())
    }
}
