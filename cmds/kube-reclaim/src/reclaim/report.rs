//! Scan and fix reports.

use std::io::{self, Write};

use nu_ansi_term::{Color, Style};
use serde::Serialize;
use tabwriter::TabWriter;

use super::{engine::ResourceHistory, namespace::NamespaceOutcome};
use crate::k8s::{discovery::SkippedKind, ResourceRef, ResourceState};

/// Overall result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
	Clean,
	PartiallyStuck,
}

/// One resource as seen by `scan`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanEntry {
	pub resource: ResourceRef,
	pub state: ResourceState,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub finalizers: Vec<String>,
}

/// Read-only view of a namespace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
	pub namespace: String,
	pub namespace_state: ResourceState,
	pub kinds_scanned: usize,
	pub resources: Vec<ScanEntry>,
	pub skipped: Vec<SkippedKind>,
}

impl ScanReport {
	pub fn found(&self) -> usize {
		self.resources.len()
	}

	pub fn terminating(&self) -> usize {
		self.resources
			.iter()
			.filter(|e| e.state == ResourceState::Terminating)
			.count()
	}

	pub fn write_table<W: Write>(&self, writer: W, colored: bool) -> io::Result<()> {
		let mut tw = TabWriter::new(writer).padding(2);
		writeln!(tw, "KIND\tNAME\tSTATE\tFINALIZERS")?;
		for entry in &self.resources {
			let finalizers = if entry.finalizers.is_empty() {
				"-".to_string()
			} else {
				entry.finalizers.join(",")
			};
			writeln!(
				tw,
				"{}\t{}\t{}\t{}",
				kind_label(&entry.resource),
				entry.resource.name,
				entry.state,
				finalizers
			)?;
		}
		tw.flush()?;

		let mut writer = tw.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
		write_skipped(&mut writer, &self.skipped)?;
		let summary = format!(
			"namespace {} is {}: {} resource(s) across {} kind(s), {} terminating",
			self.namespace,
			self.namespace_state,
			self.found(),
			self.kinds_scanned,
			self.terminating()
		);
		let style = if self.terminating() > 0 {
			Style::new().fg(Color::Yellow)
		} else {
			Style::new()
		};
		writeln!(writer, "{}", paint(style, &summary, colored))
	}
}

/// Result of `fix`, `fix-one` or `delete-namespace`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
	pub namespace: String,
	pub dry_run: bool,
	/// Targets a dry run would escalate.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub planned: Vec<ResourceRef>,
	pub resources: Vec<ResourceHistory>,
	pub skipped: Vec<SkippedKind>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub namespace_outcome: Option<NamespaceOutcome>,
	pub verdict: Verdict,
}

impl SessionReport {
	pub fn new(namespace: &str, dry_run: bool) -> Self {
		Self {
			namespace: namespace.to_string(),
			dry_run,
			planned: Vec::new(),
			resources: Vec::new(),
			skipped: Vec::new(),
			namespace_outcome: None,
			verdict: Verdict::Clean,
		}
	}

	/// Recompute the verdict from the recorded outcomes.
	///
	/// A dry run is clean only when nothing would be attempted.
	pub fn conclude(mut self) -> Self {
		let resources_clean = self.planned.is_empty() && self.resources.iter().all(ResourceHistory::reclaimed);
		let namespace_clean = self
			.namespace_outcome
			.as_ref()
			.is_none_or(NamespaceOutcome::reclaimed);
		self.verdict = if resources_clean && namespace_clean {
			Verdict::Clean
		} else {
			Verdict::PartiallyStuck
		};
		self
	}

	pub fn reclaimed(&self) -> usize {
		self.resources.iter().filter(|h| h.reclaimed()).count()
	}

	pub fn write_table<W: Write>(&self, writer: W, colored: bool) -> io::Result<()> {
		let mut tw = TabWriter::new(writer).padding(2);
		if self.dry_run {
			writeln!(tw, "KIND\tNAME\tACTION")?;
			for target in &self.planned {
				writeln!(tw, "{}\t{}\twould escalate", kind_label(target), target.name)?;
			}
		} else if !self.resources.is_empty() {
			writeln!(tw, "KIND\tNAME\tRESULT\tSTRATEGY\tSTATE\tATTEMPTS")?;
			for history in &self.resources {
				let result = if history.reclaimed() {
					"reclaimed"
				} else {
					"stuck"
				};
				let strategy = history
					.reclaimed_by()
					.map_or_else(|| "-".to_string(), |s| s.to_string());
				writeln!(
					tw,
					"{}\t{}\t{}\t{}\t{}\t{}",
					kind_label(&history.resource),
					history.resource.name,
					result,
					strategy,
					history.final_state,
					history.attempts.len()
				)?;
			}
		}
		tw.flush()?;

		let mut writer = tw.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
		write_skipped(&mut writer, &self.skipped)?;

		if let Some(ns) = &self.namespace_outcome {
			let mut line = format!("namespace {}: {}", ns.name, ns.final_state);
			if let Some(detail) = &ns.detail {
				line.push_str(&format!(" ({detail})"));
			}
			writeln!(writer, "{line}")?;
		}

		let (summary, style) = match (self.dry_run, self.verdict) {
			(true, _) => (
				format!(
					"dry run: {} resource(s) in {} would be escalated",
					self.planned.len(),
					self.namespace
				),
				Style::new(),
			),
			(false, Verdict::Clean) => (
				format!(
					"{}: clean, {} resource(s) reclaimed",
					self.namespace,
					self.reclaimed()
				),
				Style::new().fg(Color::Green),
			),
			(false, Verdict::PartiallyStuck) => (
				format!(
					"{}: partially stuck, {} of {} resource(s) reclaimed",
					self.namespace,
					self.reclaimed(),
					self.resources.len()
				),
				Style::new().fg(Color::Red).bold(),
			),
		};
		writeln!(writer, "{}", paint(style, &summary, colored))
	}
}

fn kind_label(resource: &ResourceRef) -> String {
	if resource.api_group.is_empty() {
		resource.kind.clone()
	} else {
		format!("{}.{}", resource.kind, resource.api_group)
	}
}

fn write_skipped<W: Write>(writer: &mut W, skipped: &[SkippedKind]) -> io::Result<()> {
	for s in skipped {
		writeln!(writer, "skipped {}: {}", s.kind, s.reason)?;
	}
	Ok(())
}

fn paint(style: Style, text: &str, colored: bool) -> String {
	if colored {
		style.paint(text).to_string()
	} else {
		text.to_string()
	}
}
