//! Scriptable fakes of the collaborator ports

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{
    AbTestSettings, BatchEvaluation, BroadcastGateway, BroadcastSnapshot, BroadcastStatus,
    DeliveryError, Notifier, OperatorAlert, Recipient, SegmentDirectory, SegmentRef, WinnerMetric,
};

use crate::clock::ManualClock;

/// One delivery recorded by the fake gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub broadcast_id: String,
    pub contact_id: String,
    pub variant: Option<String>,
}

#[derive(Default)]
struct GatewayInner {
    broadcasts: HashMap<String, BroadcastSnapshot>,
    recipients: HashMap<String, Vec<Recipient>>,
    failures: HashMap<String, DeliveryError>,
    sending_limit_after: Option<usize>,
    auto_winner: Option<String>,
    sends: Vec<SentMessage>,
    status_updates: Vec<(String, BroadcastStatus)>,
    clock_step: Option<(ManualClock, Duration)>,
}

#[derive(Clone, Default)]
pub struct FakeBroadcastGateway {
    inner: Arc<Mutex<GatewayInner>>,
}

impl FakeBroadcastGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-variant broadcast with `recipients` generated contacts `c_0000..`
    pub fn add_broadcast(&self, broadcast_id: &str, recipients: usize) {
        self.add_snapshot(
            BroadcastSnapshot {
                id: broadcast_id.to_string(),
                status: BroadcastStatus::Scheduled,
                channel_type: "email".to_string(),
                variants: vec!["tpl_a".to_string()],
                ab_testing: None,
                winning_variant: None,
            },
            recipients,
        );
    }

    pub fn add_ab_broadcast(&self, broadcast_id: &str, recipients: usize, ab: AbTestSettings) {
        self.add_snapshot(
            BroadcastSnapshot {
                id: broadcast_id.to_string(),
                status: BroadcastStatus::Scheduled,
                channel_type: "email".to_string(),
                variants: vec!["tpl_a".to_string(), "tpl_b".to_string()],
                ab_testing: Some(ab),
                winning_variant: None,
            },
            recipients,
        );
    }

    pub fn add_snapshot(&self, snapshot: BroadcastSnapshot, recipients: usize) {
        let list = (0..recipients)
            .map(|i| Recipient {
                contact_id: format!("c_{i:04}"),
                address: format!("user{i}@example.com"),
            })
            .collect();
        let mut inner = self.inner.lock().unwrap();
        inner.recipients.insert(snapshot.id.clone(), list);
        inner.broadcasts.insert(snapshot.id.clone(), snapshot);
    }

    pub fn set_status(&self, broadcast_id: &str, status: BroadcastStatus) {
        if let Some(b) = self.inner.lock().unwrap().broadcasts.get_mut(broadcast_id) {
            b.status = status;
        }
    }

    pub fn status(&self, broadcast_id: &str) -> Option<BroadcastStatus> {
        self.inner
            .lock()
            .unwrap()
            .broadcasts
            .get(broadcast_id)
            .map(|b| b.status)
    }

    /// Manual winner selection by an operator
    pub fn choose_winner(&self, broadcast_id: &str, variant: &str) {
        if let Some(b) = self.inner.lock().unwrap().broadcasts.get_mut(broadcast_id) {
            b.winning_variant = Some(variant.to_string());
        }
    }

    /// Result returned by metric-based `select_winner`
    pub fn set_auto_winner(&self, variant: Option<&str>) {
        self.inner.lock().unwrap().auto_winner = variant.map(str::to_string);
    }

    pub fn fail_recipient(&self, contact_id: &str, error: DeliveryError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert(contact_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    /// Provider quota: sends beyond `n` successful deliveries report the limit
    pub fn limit_sends_to(&self, n: Option<usize>) {
        self.inner.lock().unwrap().sending_limit_after = n;
    }

    /// Each send moves `clock` forward, simulating provider latency
    pub fn advance_clock_per_send(&self, clock: ManualClock, step: Duration) {
        self.inner.lock().unwrap().clock_step = Some((clock, step));
    }

    pub fn sends(&self) -> Vec<SentMessage> {
        self.inner.lock().unwrap().sends.clone()
    }

    pub fn send_count(&self) -> usize {
        self.inner.lock().unwrap().sends.len()
    }

    pub fn status_updates(&self) -> Vec<(String, BroadcastStatus)> {
        self.inner.lock().unwrap().status_updates.clone()
    }

    fn snapshot(&self, broadcast_id: &str) -> SchedulerResult<BroadcastSnapshot> {
        self.inner
            .lock()
            .unwrap()
            .broadcasts
            .get(broadcast_id)
            .cloned()
            .ok_or_else(|| SchedulerError::validation_error(format!("群发不存在: {broadcast_id}")))
    }
}

#[async_trait]
impl BroadcastGateway for FakeBroadcastGateway {
    async fn get_broadcast(
        &self,
        _workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<BroadcastSnapshot> {
        self.snapshot(broadcast_id)
    }

    async fn count_recipients(
        &self,
        _workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .recipients
            .get(broadcast_id)
            .map(|r| r.len() as i64)
            .unwrap_or(0))
    }

    async fn fetch_recipients(
        &self,
        _workspace_id: &str,
        broadcast_id: &str,
        offset: i64,
        limit: i64,
    ) -> SchedulerResult<Vec<Recipient>> {
        let inner = self.inner.lock().unwrap();
        let all = inner
            .recipients
            .get(broadcast_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let start = usize::try_from(offset).unwrap_or(0).min(all.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(0))
            .min(all.len());
        Ok(all[start..end].to_vec())
    }

    async fn send(
        &self,
        _workspace_id: &str,
        broadcast_id: &str,
        recipient: &Recipient,
        variant: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((clock, step)) = &inner.clock_step {
            clock.advance(*step);
        }
        if let Some(limit) = inner.sending_limit_after {
            if inner.sends.len() >= limit {
                return Err(DeliveryError::SendingLimitReached(
                    "daily quota exhausted".to_string(),
                ));
            }
        }
        if let Some(error) = inner.failures.get(&recipient.contact_id) {
            return Err(error.clone());
        }
        inner.sends.push(SentMessage {
            broadcast_id: broadcast_id.to_string(),
            contact_id: recipient.contact_id.clone(),
            variant: variant.map(str::to_string),
        });
        Ok(())
    }

    async fn select_winner(
        &self,
        _workspace_id: &str,
        _broadcast_id: &str,
        _metric: WinnerMetric,
    ) -> SchedulerResult<Option<String>> {
        Ok(self.inner.lock().unwrap().auto_winner.clone())
    }

    async fn update_status(
        &self,
        _workspace_id: &str,
        broadcast_id: &str,
        status: BroadcastStatus,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(b) = inner.broadcasts.get_mut(broadcast_id) {
            b.status = status;
        }
        inner
            .status_updates
            .push((broadcast_id.to_string(), status));
        Ok(())
    }
}

/// Notifier that records every alert
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    alerts: Arc<Mutex<Vec<(String, OperatorAlert)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(String, OperatorAlert)> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, workspace_id: &str, alert: &OperatorAlert) -> SchedulerResult<()> {
        self.alerts
            .lock()
            .unwrap()
            .push((workspace_id.to_string(), alert.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSegment {
    pub version: i64,
    pub recompute_after: Option<DateTime<Utc>>,
    pub build_scheduled: bool,
    /// Membership result per contact, in stable order
    pub contacts: Vec<bool>,
    pub finished: Option<(i64, i64)>,
}

#[derive(Default)]
struct DirectoryInner {
    segments: BTreeMap<(String, String), FakeSegment>,
    evaluated: Vec<(String, i64, i64)>,
    fail_evaluation: bool,
}

#[derive(Clone, Default)]
pub struct FakeSegmentDirectory {
    inner: Arc<Mutex<DirectoryInner>>,
}

impl FakeSegmentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `match_every`-th contact matches the segment predicate
    pub fn add_segment(
        &self,
        workspace_id: &str,
        segment_id: &str,
        contacts: usize,
        match_every: usize,
        recompute_after: Option<DateTime<Utc>>,
    ) {
        let step = match_every.max(1);
        let segment = FakeSegment {
            version: 0,
            recompute_after,
            build_scheduled: false,
            contacts: (0..contacts).map(|i| i % step == 0).collect(),
            finished: None,
        };
        self.inner
            .lock()
            .unwrap()
            .segments
            .insert((workspace_id.to_string(), segment_id.to_string()), segment);
    }

    pub fn segment(&self, workspace_id: &str, segment_id: &str) -> Option<FakeSegment> {
        self.inner
            .lock()
            .unwrap()
            .segments
            .get(&(workspace_id.to_string(), segment_id.to_string()))
            .cloned()
    }

    pub fn set_recompute_after(&self, workspace_id: &str, segment_id: &str, at: DateTime<Utc>) {
        if let Some(s) = self
            .inner
            .lock()
            .unwrap()
            .segments
            .get_mut(&(workspace_id.to_string(), segment_id.to_string()))
        {
            s.recompute_after = Some(at);
        }
    }

    /// (segment_id, offset, limit) of every evaluated batch
    pub fn evaluated_batches(&self) -> Vec<(String, i64, i64)> {
        self.inner.lock().unwrap().evaluated.clone()
    }

    pub fn set_fail_evaluation(&self, fail: bool) {
        self.inner.lock().unwrap().fail_evaluation = fail;
    }
}

#[async_trait]
impl SegmentDirectory for FakeSegmentDirectory {
    async fn segments_due(
        &self,
        workspace_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<SegmentRef>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .segments
            .iter()
            .filter(|((ws, _), s)| {
                ws == workspace_id
                    && !s.build_scheduled
                    && s.recompute_after.map(|at| at <= now).unwrap_or(false)
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|((_, id), s)| SegmentRef {
                segment_id: id.clone(),
                version: s.version + 1,
            })
            .collect())
    }

    async fn mark_build_scheduled(
        &self,
        workspace_id: &str,
        segment_id: &str,
        version: i64,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let segment = inner
            .segments
            .get_mut(&(workspace_id.to_string(), segment_id.to_string()))
            .ok_or_else(|| SchedulerError::validation_error(format!("分群不存在: {segment_id}")))?;
        segment.version = version;
        segment.build_scheduled = true;
        segment.recompute_after = None;
        Ok(())
    }

    async fn count_contacts(&self, workspace_id: &str, segment_id: &str) -> SchedulerResult<i64> {
        Ok(self
            .segment(workspace_id, segment_id)
            .map(|s| s.contacts.len() as i64)
            .unwrap_or(0))
    }

    async fn evaluate_batch(
        &self,
        workspace_id: &str,
        segment_id: &str,
        _version: i64,
        offset: i64,
        limit: i64,
    ) -> SchedulerResult<BatchEvaluation> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_evaluation {
            return Err(SchedulerError::Network("segment evaluator unreachable".to_string()));
        }
        inner.evaluated.push((segment_id.to_string(), offset, limit));
        let contacts = inner
            .segments
            .get(&(workspace_id.to_string(), segment_id.to_string()))
            .map(|s| s.contacts.clone())
            .unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(0).min(contacts.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(0))
            .min(contacts.len());
        let batch = &contacts[start..end];
        Ok(BatchEvaluation {
            processed: batch.len() as i64,
            matched: batch.iter().filter(|m| **m).count() as i64,
        })
    }

    async fn finish_build(
        &self,
        workspace_id: &str,
        segment_id: &str,
        version: i64,
        matched: i64,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(segment) = inner
            .segments
            .get_mut(&(workspace_id.to_string(), segment_id.to_string()))
        {
            segment.finished = Some((version, matched));
            segment.build_scheduled = false;
        }
        Ok(())
    }
}
