use comfy_table::{
  modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, CellAlignment, Color,
  ContentArrangement, Table,
};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutcome {
  Ok,
  Failed,
  Skipped,
  WouldRun,
}

impl StepOutcome {
  pub fn label(self) -> &'static str {
    match self {
      StepOutcome::Ok => "ok",
      StepOutcome::Failed => "failed",
      StepOutcome::Skipped => "skipped",
      StepOutcome::WouldRun => "would run",
    }
  }

  fn color(self) -> Color {
    match self {
      StepOutcome::Ok => Color::Green,
      StepOutcome::Failed => Color::Red,
      StepOutcome::Skipped => Color::DarkGrey,
      StepOutcome::WouldRun => Color::Cyan,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
  pub step: String,
  pub outcome: StepOutcome,
  pub message: String,
}

/// Ordered outcome of every step a run reached. Records are only appended.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
  pub workflow: String,
  pub dry_run: bool,
  records: Vec<StepRecord>,
}

impl ExecutionReport {
  pub fn new(workflow: &str, dry_run: bool) -> Self {
    Self {
      workflow: workflow.to_string(),
      dry_run,
      records: Vec::new(),
    }
  }

  pub fn record(&mut self, step: &str, outcome: StepOutcome, message: impl Into<String>) {
    self.records.push(StepRecord {
      step: step.to_string(),
      outcome,
      message: message.into(),
    });
  }

  pub fn records(&self) -> &[StepRecord] {
    &self.records
  }

  pub fn count(&self, outcome: StepOutcome) -> usize {
    self.records.iter().filter(|r| r.outcome == outcome).count()
  }

  pub fn outcome_of(&self, step: &str) -> Option<StepOutcome> {
    self
      .records
      .iter()
      .rev()
      .find(|r| r.step == step)
      .map(|r| r.outcome)
  }

  pub fn print_summary(&self) {
    if self.records.is_empty() {
      return;
    }
    println!();
    let title = if self.dry_run {
      format!(" {} (dry run) ", self.workflow)
    } else {
      format!(" {} ", self.workflow)
    };
    println!("{:-^64}", title);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
      [("Step", CellAlignment::Left), ("Outcome", CellAlignment::Center), ("Detail", CellAlignment::Left)]
        .iter()
        .map(|(title, align)| {
          Cell::new(*title)
            .add_attribute(Attribute::Bold)
            .set_alignment(*align)
        })
        .collect::<Vec<_>>(),
    );
    for record in &self.records {
      table.add_row(vec![
        Cell::new(&record.step),
        Cell::new(record.outcome.label())
          .fg(record.outcome.color())
          .set_alignment(CellAlignment::Center),
        Cell::new(&record.message),
      ]);
    }
    for line in table.to_string().lines() {
      println!("  {}", line);
    }
    println!(
      "  {} ok, {} failed, {} skipped, {} would run",
      self.count(StepOutcome::Ok),
      self.count(StepOutcome::Failed),
      self.count(StepOutcome::Skipped),
      self.count(StepOutcome::WouldRun)
    );
  }

  pub fn write_json(&self, path: &Path) -> io::Result<()> {
    let json = serde_json::to_string_pretty(self).map_err(to_io_error)?;
    fs::write(path, json)
  }
}

fn to_io_error(err: serde_json::Error) -> io::Error {
  io::Error::new(io::ErrorKind::Other, err)
}
