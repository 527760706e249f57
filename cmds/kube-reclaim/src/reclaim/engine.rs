//! Per-resource escalation.
//!
//! A resource is driven through increasingly invasive strategies, one at a
//! time, until a fresh read confirms it is gone or every strategy has been
//! tried:
//!
//! 1. normal delete
//! 2. merge patch clearing `metadata.finalizers`
//! 3. PUT of a finalizer-free copy to the `finalize` subresource via the proxy
//! 4. delete with a zero grace period, then a JSON patch removing the finalizers
//!
//! Each step's own success is never taken as proof. Only a `NotFound` read
//! after the step ends escalation.

use std::{fmt, time::Duration};

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::instrument;

use super::{
	payload::{FinalizerField, PayloadStage},
	proxy::{ProxyManager, TunnelLauncher},
};
use crate::k8s::{
	api::{fetch, retry_transient, ApiError, ClusterApi, FinalizeResponse, FinalizerPatch},
	ResourceRef, ResourceState,
};

/// Reclamation strategies in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Strategy {
	NormalDelete,
	FinalizerPatch,
	ProxyFinalize,
	ForceDeleteGracePeriodZero,
	JsonPatchRemoveFinalizers,
}

impl fmt::Display for Strategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::NormalDelete => "NormalDelete",
			Self::FinalizerPatch => "FinalizerPatch",
			Self::ProxyFinalize => "ProxyFinalize",
			Self::ForceDeleteGracePeriodZero => "ForceDelete",
			Self::JsonPatchRemoveFinalizers => "JsonPatch",
		};
		f.write_str(s)
	}
}

/// How a strategy's own call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
	Success,
	Failed,
	TimedOut,
}

/// One strategy applied to one resource.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationAttempt {
	pub strategy: Strategy,
	pub outcome: AttemptOutcome,
	/// A read after the step returned `NotFound`.
	pub verified_gone: bool,
	/// State seen by that read.
	pub observed: ResourceState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

/// Escalation progress of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EscalationState {
	Discovered,
	Deleting,
	Stuck,
	FinalizersPatched,
	StillStuck,
	ProxyFinalized,
	ForceDeleted,
	Gone,
	Exhausted,
}

/// Full record of one resource's escalation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHistory {
	pub resource: ResourceRef,
	pub attempts: Vec<EscalationAttempt>,
	pub trail: Vec<EscalationState>,
	pub final_state: ResourceState,
}

impl ResourceHistory {
	fn new(resource: ResourceRef) -> Self {
		Self {
			resource,
			attempts: Vec::new(),
			trail: vec![EscalationState::Discovered],
			final_state: ResourceState::Unknown,
		}
	}

	pub fn reclaimed(&self) -> bool {
		self.final_state == ResourceState::Gone
	}

	/// Strategy whose verification first confirmed absence.
	pub fn reclaimed_by(&self) -> Option<Strategy> {
		self.attempts
			.iter()
			.find(|a| a.verified_gone)
			.map(|a| a.strategy)
	}

	pub fn strategies(&self) -> Vec<Strategy> {
		self.attempts.iter().map(|a| a.strategy).collect()
	}

	fn record(&mut self, attempt: EscalationAttempt) -> bool {
		let gone = attempt.verified_gone;
		self.final_state = attempt.observed;
		self.attempts.push(attempt);
		gone
	}

	fn finish(mut self, state: EscalationState) -> Self {
		self.trail.push(state);
		self
	}
}

/// Timing of the escalation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationSettings {
	/// Upper bound on the normal and forced delete calls.
	pub delete_timeout: Duration,
	/// Pause between a mutating call and its verification read.
	pub settle: Duration,
}

impl Default for EscalationSettings {
	fn default() -> Self {
		Self {
			delete_timeout: Duration::from_secs(5),
			settle: Duration::from_secs(1),
		}
	}
}

/// Drives single resources through the strategies.
pub struct EscalationEngine<'a, A> {
	api: &'a A,
	settings: EscalationSettings,
}

impl<'a, A: ClusterApi> EscalationEngine<'a, A> {
	pub fn new(api: &'a A, settings: EscalationSettings) -> Self {
		Self { api, settings }
	}

	/// Escalate until `target` is verified gone or every strategy was tried.
	#[instrument(skip_all, fields(resource = %target))]
	pub async fn reclaim<L: TunnelLauncher>(
		&self,
		target: &ResourceRef,
		proxy: &mut ProxyManager<L>,
		stage: &PayloadStage,
	) -> ResourceHistory {
		let mut history = ResourceHistory::new(target.clone());

		history.trail.push(EscalationState::Deleting);
		if history.record(self.normal_delete(target).await) {
			return history.finish(EscalationState::Gone);
		}
		history.trail.push(EscalationState::Stuck);

		let (patch, patched) = self.finalizer_patch(target).await;
		if patched {
			history.trail.push(EscalationState::FinalizersPatched);
		}
		if history.record(patch) {
			return history.finish(EscalationState::Gone);
		}
		history.trail.push(EscalationState::StillStuck);

		let finalize = self.proxy_finalize(target, proxy, stage).await;
		let finalized = finalize.outcome == AttemptOutcome::Success;
		if finalized {
			history.trail.push(EscalationState::ProxyFinalized);
		}
		if history.record(finalize) {
			return history.finish(EscalationState::Gone);
		}
		if finalized {
			history.trail.push(EscalationState::StillStuck);
		}

		let forced = self.force_delete(target).await;
		if forced.outcome == AttemptOutcome::Success {
			history.trail.push(EscalationState::ForceDeleted);
		}
		if history.record(forced) {
			return history.finish(EscalationState::Gone);
		}
		if history.record(self.json_patch(target).await) {
			return history.finish(EscalationState::Gone);
		}

		tracing::warn!(state = %history.final_state, "all strategies exhausted");
		history.finish(EscalationState::Exhausted)
	}

	/// Fresh read of `target`. Never reports `Gone` without a `NotFound`.
	async fn verify(&self, target: &ResourceRef) -> ResourceState {
		match fetch(self.api, target).await {
			Ok(None) => ResourceState::Gone,
			Ok(Some(observed)) => observed.state,
			Err(err) => {
				tracing::warn!(error = %err, "verification read failed");
				ResourceState::Unknown
			}
		}
	}

	async fn settle_and_verify(&self, target: &ResourceRef) -> ResourceState {
		sleep(self.settings.settle).await;
		self.verify(target).await
	}

	async fn bounded_delete(
		&self,
		target: &ResourceRef,
		grace_period_seconds: Option<u32>,
	) -> (AttemptOutcome, Option<String>) {
		let call = retry_transient(|| self.api.delete(target, grace_period_seconds));
		match timeout(self.settings.delete_timeout, call).await {
			Ok(Ok(()) | Err(ApiError::NotFound(_))) => (AttemptOutcome::Success, None),
			Ok(Err(err)) => (AttemptOutcome::Failed, Some(err.to_string())),
			Err(_) => {
				tracing::info!(timeout = ?self.settings.delete_timeout, "delete did not return in time");
				(
					AttemptOutcome::TimedOut,
					Some(format!("no response within {:?}", self.settings.delete_timeout)),
				)
			}
		}
	}

	#[instrument(skip_all, fields(strategy = %Strategy::NormalDelete))]
	async fn normal_delete(&self, target: &ResourceRef) -> EscalationAttempt {
		let (outcome, detail) = self.bounded_delete(target, None).await;
		let observed = self.settle_and_verify(target).await;
		attempt(Strategy::NormalDelete, outcome, observed, detail)
	}

	/// The flag tells whether a patch call was actually accepted.
	#[instrument(skip_all, fields(strategy = %Strategy::FinalizerPatch))]
	async fn finalizer_patch(&self, target: &ResourceRef) -> (EscalationAttempt, bool) {
		let finalizers = match fetch(self.api, target).await {
			Ok(None) => {
				let gone = attempt(
					Strategy::FinalizerPatch,
					AttemptOutcome::Success,
					ResourceState::Gone,
					None,
				);
				return (gone, false);
			}
			Ok(Some(observed)) => Some(observed.finalizers()),
			Err(err) => {
				tracing::debug!(error = %err, "could not read finalizers, patching anyway");
				None
			}
		};

		if finalizers.as_ref().is_some_and(Vec::is_empty) {
			tracing::debug!("no finalizers to remove");
			let observed = self.settle_and_verify(target).await;
			let skipped = attempt(
				Strategy::FinalizerPatch,
				AttemptOutcome::Success,
				observed,
				Some("no finalizers present".to_string()),
			);
			return (skipped, false);
		}

		let (outcome, detail, patched) =
			match retry_transient(|| self.api.patch(target, FinalizerPatch::MergeNull)).await {
				Ok(()) => (AttemptOutcome::Success, None, true),
				Err(ApiError::NotFound(_)) => (AttemptOutcome::Success, None, false),
				Err(err) => (AttemptOutcome::Failed, Some(err.to_string()), false),
			};
		let observed = self.settle_and_verify(target).await;
		(attempt(Strategy::FinalizerPatch, outcome, observed, detail), patched)
	}

	#[instrument(skip_all, fields(strategy = %Strategy::ProxyFinalize))]
	async fn proxy_finalize<L: TunnelLauncher>(
		&self,
		target: &ResourceRef,
		proxy: &mut ProxyManager<L>,
		stage: &PayloadStage,
	) -> EscalationAttempt {
		let endpoint = match proxy.acquire().await {
			Ok(endpoint) => endpoint,
			Err(err) => {
				tracing::warn!(error = %err, "API proxy unavailable");
				let observed = self.verify(target).await;
				return attempt(
					Strategy::ProxyFinalize,
					AttemptOutcome::Failed,
					observed,
					Some(err.to_string()),
				);
			}
		};

		let observed = match fetch(self.api, target).await {
			Ok(Some(observed)) => observed,
			Ok(None) => {
				return attempt(
					Strategy::ProxyFinalize,
					AttemptOutcome::Success,
					ResourceState::Gone,
					None,
				);
			}
			Err(err) => {
				return attempt(
					Strategy::ProxyFinalize,
					AttemptOutcome::Failed,
					ResourceState::Unknown,
					Some(err.to_string()),
				);
			}
		};
		let expected_kind = observed.kind().map(str::to_string);

		let payload = match stage.stage(target, observed.object, FinalizerField::Metadata) {
			Ok(path) => path,
			Err(err) => {
				let observed = self.verify(target).await;
				return attempt(
					Strategy::ProxyFinalize,
					AttemptOutcome::Failed,
					observed,
					Some(err.to_string()),
				);
			}
		};

		let (outcome, detail) =
			match retry_transient(|| self.api.finalize(target, &endpoint, &payload)).await {
				Ok(response) => finalize_outcome(&response, expected_kind.as_deref()),
				Err(err) => (AttemptOutcome::Failed, Some(err.to_string())),
			};
		let observed = self.settle_and_verify(target).await;
		attempt(Strategy::ProxyFinalize, outcome, observed, detail)
	}

	#[instrument(skip_all, fields(strategy = %Strategy::ForceDeleteGracePeriodZero))]
	async fn force_delete(&self, target: &ResourceRef) -> EscalationAttempt {
		let (outcome, detail) = self.bounded_delete(target, Some(0)).await;
		let observed = self.settle_and_verify(target).await;
		attempt(Strategy::ForceDeleteGracePeriodZero, outcome, observed, detail)
	}

	#[instrument(skip_all, fields(strategy = %Strategy::JsonPatchRemoveFinalizers))]
	async fn json_patch(&self, target: &ResourceRef) -> EscalationAttempt {
		let (outcome, detail) =
			match retry_transient(|| self.api.patch(target, FinalizerPatch::JsonRemove)).await {
				Ok(()) | Err(ApiError::NotFound(_)) => (AttemptOutcome::Success, None),
				Err(err) => (AttemptOutcome::Failed, Some(err.to_string())),
			};
		let observed = self.settle_and_verify(target).await;
		attempt(Strategy::JsonPatchRemoveFinalizers, outcome, observed, detail)
	}
}

fn attempt(
	strategy: Strategy,
	outcome: AttemptOutcome,
	observed: ResourceState,
	detail: Option<String>,
) -> EscalationAttempt {
	tracing::debug!(%strategy, ?outcome, %observed, "strategy finished");
	EscalationAttempt {
		strategy,
		outcome,
		verified_gone: observed == ResourceState::Gone,
		observed,
		detail,
	}
}

fn finalize_outcome(
	response: &FinalizeResponse,
	expected_kind: Option<&str>,
) -> (AttemptOutcome, Option<String>) {
	match response {
		FinalizeResponse::Rejected { status, reason } => (
			AttemptOutcome::Failed,
			Some(format!("finalize rejected ({status}): {reason}")),
		),
		FinalizeResponse::Accepted { kind } => match expected_kind {
			Some(expected) if !response.confirms(expected) => (
				AttemptOutcome::Success,
				Some(format!(
					"finalize answered with {}",
					kind.as_deref().unwrap_or("no kind")
				)),
			),
			_ => (AttemptOutcome::Success, None),
		},
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;
	use crate::test_utils::{fast_escalation, pods, Effect, FakeCluster, FakeLauncher, FakeOp};

	fn proxy(launcher: &FakeLauncher) -> ProxyManager<FakeLauncher> {
		ProxyManager::new(launcher.clone(), crate::test_utils::fast_proxy())
	}

	async fn run(fake: &FakeCluster, name: &str) -> (ResourceHistory, FakeLauncher) {
		let launcher = FakeLauncher::healthy();
		let mut proxy = proxy(&launcher);
		let stage = PayloadStage::new().unwrap();
		let engine = EscalationEngine::new(fake, fast_escalation());

		let history = engine.reclaim(&fake.pod_ref("ns1", name), &mut proxy, &stage).await;
		proxy.release().await;
		(history, launcher)
	}

	#[tokio::test]
	async fn plain_delete_is_enough() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &[]);

		let (history, launcher) = run(&fake, "web").await;

		assert!(history.reclaimed());
		assert_eq!(history.strategies(), vec![Strategy::NormalDelete]);
		assert_eq!(
			history.trail,
			vec![
				EscalationState::Discovered,
				EscalationState::Deleting,
				EscalationState::Gone
			]
		);
		assert_eq!(launcher.launches(), 0);
	}

	#[tokio::test]
	async fn empty_finalizers_skip_the_patch() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &[]);
		fake.set_removal_lag("web", 2);

		let (history, _) = run(&fake, "web").await;

		assert!(history.reclaimed());
		assert_eq!(history.reclaimed_by(), Some(Strategy::FinalizerPatch));
		assert_eq!(fake.calls(FakeOp::MergePatch), 0);
		assert_eq!(
			history.attempts[1].detail.as_deref(),
			Some("no finalizers present")
		);
		assert!(!history.trail.contains(&EscalationState::FinalizersPatched));
	}

	#[test]
	fn missing_finalize_subresource_is_a_failure() {
		let response = FinalizeResponse::Rejected {
			status: 404,
			reason: "the server could not find the requested resource".to_string(),
		};

		let (outcome, detail) = finalize_outcome(&response, Some("Pod"));

		assert_eq!(outcome, AttemptOutcome::Failed);
		assert!(detail.is_some_and(|d| d.contains("404")));
	}

	#[rstest]
	#[case::normal_delete(0, Strategy::NormalDelete)]
	#[case::finalizer_patch(1, Strategy::FinalizerPatch)]
	#[case::proxy_finalize(2, Strategy::ProxyFinalize)]
	#[case::force_delete(3, Strategy::ForceDeleteGracePeriodZero)]
	#[case::json_patch(4, Strategy::JsonPatchRemoveFinalizers)]
	#[tokio::test]
	async fn stops_at_first_verified_strategy(#[case] effective: usize, #[case] expected: Strategy) {
		let ops = [
			FakeOp::Delete,
			FakeOp::MergePatch,
			FakeOp::Finalize,
			FakeOp::ForceDelete,
			FakeOp::JsonPatch,
		];
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		for (i, op) in ops.iter().enumerate() {
			let effect = if i == effective {
				Effect::Remove
			} else {
				Effect::Ineffective
			};
			fake.set_effect("web", *op, effect);
		}

		let (history, _) = run(&fake, "web").await;

		let expected_order = [
			Strategy::NormalDelete,
			Strategy::FinalizerPatch,
			Strategy::ProxyFinalize,
			Strategy::ForceDeleteGracePeriodZero,
			Strategy::JsonPatchRemoveFinalizers,
		];
		assert!(history.reclaimed());
		assert_eq!(history.reclaimed_by(), Some(expected));
		assert_eq!(history.strategies(), expected_order[..=effective].to_vec());
		for op in &ops[effective + 1..] {
			assert_eq!(fake.calls(*op), 0, "{op:?} should not run");
		}
	}

	#[tokio::test]
	async fn hung_delete_times_out_then_patch_reclaims() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		fake.set_effect("web", FakeOp::Delete, Effect::Hang);

		let (history, launcher) = run(&fake, "web").await;

		assert_eq!(history.attempts[0].outcome, AttemptOutcome::TimedOut);
		assert_eq!(history.reclaimed_by(), Some(Strategy::FinalizerPatch));
		assert!(history.trail.contains(&EscalationState::FinalizersPatched));
		assert_eq!(launcher.launches(), 0);
	}

	#[tokio::test]
	async fn unavailable_proxy_moves_on_to_force_delete() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		fake.set_effect("web", FakeOp::MergePatch, Effect::Forbidden);
		fake.set_effect("web", FakeOp::ForceDelete, Effect::Remove);

		let launcher = FakeLauncher::unhealthy();
		let mut proxy = proxy(&launcher);
		let stage = PayloadStage::new().unwrap();
		let engine = EscalationEngine::new(&fake, fast_escalation());
		let history = engine.reclaim(&fake.pod_ref("ns1", "web"), &mut proxy, &stage).await;

		assert_eq!(history.attempts[2].strategy, Strategy::ProxyFinalize);
		assert_eq!(history.attempts[2].outcome, AttemptOutcome::Failed);
		assert_eq!(history.reclaimed_by(), Some(Strategy::ForceDeleteGracePeriodZero));
		assert_eq!(fake.calls(FakeOp::Finalize), 0);
	}

	#[tokio::test]
	async fn finalize_payload_has_no_finalizers() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		fake.set_effect("web", FakeOp::MergePatch, Effect::Forbidden);

		let (history, launcher) = run(&fake, "web").await;

		assert_eq!(history.reclaimed_by(), Some(Strategy::ProxyFinalize));
		let payloads = fake.finalize_payloads();
		assert_eq!(payloads.len(), 1);
		assert!(payloads[0].pointer("/metadata/finalizers").is_none());
		assert_eq!(payloads[0]["metadata"]["name"], "web");
		assert_eq!(launcher.launches(), 1);
		assert_eq!(launcher.terminations(), 1);
	}

	#[tokio::test]
	async fn nothing_works_exhausts() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		for op in [
			FakeOp::Delete,
			FakeOp::MergePatch,
			FakeOp::Finalize,
			FakeOp::ForceDelete,
			FakeOp::JsonPatch,
		] {
			fake.set_effect("web", op, Effect::Ineffective);
		}

		let (history, _) = run(&fake, "web").await;

		assert!(!history.reclaimed());
		assert_eq!(history.attempts.len(), 5);
		assert_eq!(history.trail.last(), Some(&EscalationState::Exhausted));
		assert_eq!(history.final_state, ResourceState::Present);
	}

	#[tokio::test]
	async fn transient_verification_is_never_gone() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &["example.io/cleanup"]);
		for op in [
			FakeOp::Delete,
			FakeOp::MergePatch,
			FakeOp::Finalize,
			FakeOp::ForceDelete,
			FakeOp::JsonPatch,
		] {
			fake.set_effect("web", op, Effect::Ineffective);
		}
		fake.fail_gets(usize::MAX);

		let (history, _) = run(&fake, "web").await;

		assert!(!history.reclaimed());
		assert!(history
			.attempts
			.iter()
			.all(|a| !a.verified_gone && a.observed == ResourceState::Unknown));
	}

	#[tokio::test]
	async fn single_transient_read_is_retried() {
		let fake = FakeCluster::new(vec![pods()]);
		fake.insert("pods", "ns1", "web", &[]);
		fake.fail_gets(1);

		let (history, _) = run(&fake, "web").await;

		assert_eq!(history.reclaimed_by(), Some(Strategy::NormalDelete));
	}
}
