//! In-process [`LogService`] that keeps groups and streams in memory.
//!
//! It enforces sequence tokens the way the remote service does and records
//! every append call, which makes it usable both for tests and for dry runs
//! of the tee without AWS credentials.

// Local crates
use crate::log_service::{LogEvent, LogService, LogServiceError, LogStreamInfo, SequenceToken};

// External crates
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// One recorded `put_log_events` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    /// Target log group.
    pub group: String,
    /// Target log stream.
    pub stream: String,
    /// Events as submitted.
    pub events: Vec<LogEvent>,
    /// Token presented by the caller.
    pub sequence_token: Option<SequenceToken>,
    /// Token handed back, set only for accepted calls.
    pub returned_token: Option<SequenceToken>,
    /// Whether the events were stored.
    pub accepted: bool,
}

#[derive(Debug, Default)]
struct StreamState {
    events: Vec<LogEvent>,
    token: Option<SequenceToken>,
}

#[derive(Debug, Default)]
struct GroupState {
    tags: Vec<(String, String)>,
    streams: BTreeMap<String, StreamState>,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<String, GroupState>,
    calls: Vec<PutCall>,
    injected_failures: VecDeque<LogServiceError>,
    issued_tokens: u64,
}

/// In-process [`LogService`] with token checks, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLogService {
    state: Mutex<State>,
    put_notify: Notify,
}

impl MemoryLogService {
    /// An empty service without groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty log group.
    pub fn with_group(self, group: &str) -> Self {
        self.lock().groups.entry(group.to_string()).or_default();
        self
    }

    /// Add a stream (and its group) whose next expected token is `token`.
    pub fn with_stream(self, group: &str, stream: &str, token: Option<&str>) -> Self {
        {
            let mut state = self.lock();
            let group = state.groups.entry(group.to_string()).or_default();
            group.streams.insert(
                stream.to_string(),
                StreamState {
                    events: Vec::new(),
                    token: token.map(SequenceToken::from),
                },
            );
        }
        self
    }

    /// Make the next append fail with `err` without touching the stream.
    pub fn fail_next_put(&self, err: LogServiceError) {
        self.lock().injected_failures.push_back(err);
    }

    /// Every append call seen so far, failed ones included.
    pub fn put_calls(&self) -> Vec<PutCall> {
        self.lock().calls.clone()
    }

    /// Events accepted for `group`/`stream`, in append order.
    pub fn events(&self, group: &str, stream: &str) -> Vec<LogEvent> {
        self.lock()
            .groups
            .get(group)
            .and_then(|g| g.streams.get(stream))
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// True once `group` exists.
    pub fn has_group(&self, group: &str) -> bool {
        self.lock().groups.contains_key(group)
    }

    /// True once `stream` exists in `group`.
    pub fn has_stream(&self, group: &str, stream: &str) -> bool {
        self.lock()
            .groups
            .get(group)
            .is_some_and(|g| g.streams.contains_key(stream))
    }

    /// Tags `group` was created with.
    pub fn group_tags(&self, group: &str) -> Vec<(String, String)> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.tags.clone())
            .unwrap_or_default()
    }

    /// Wait until at least `count` append calls have been recorded.
    pub async fn wait_for_put_calls(&self, count: usize) {
        loop {
            let notified = self.put_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().calls.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LogService for MemoryLogService {
    async fn describe_log_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, LogServiceError> {
        let state = self.lock();
        let Some(group_state) = state.groups.get(group) else {
            return Err(LogServiceError::LogGroupNotFound {
                group: group.to_string(),
                message: "the specified log group does not exist".to_string(),
            });
        };
        Ok(group_state
            .streams
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, stream)| LogStreamInfo {
                name: name.clone(),
                upload_sequence_token: stream.token.clone(),
            })
            .collect())
    }

    async fn create_log_group(
        &self,
        group: &str,
        tags: &[(&str, &str)],
    ) -> Result<(), LogServiceError> {
        let mut state = self.lock();
        if state.groups.contains_key(group) {
            return Err(LogServiceError::ResourceAlreadyExists {
                message: format!("log group {group} already exists"),
            });
        }
        state.groups.insert(
            group.to_string(),
            GroupState {
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                streams: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), LogServiceError> {
        let mut state = self.lock();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Err(LogServiceError::LogGroupNotFound {
                group: group.to_string(),
                message: "the specified log group does not exist".to_string(),
            });
        };
        if group_state.streams.contains_key(stream) {
            return Err(LogServiceError::ResourceAlreadyExists {
                message: format!("log stream {stream} already exists"),
            });
        }
        group_state
            .streams
            .insert(stream.to_string(), StreamState::default());
        Ok(())
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&SequenceToken>,
    ) -> Result<Option<SequenceToken>, LogServiceError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut call = PutCall {
            group: group.to_string(),
            stream: stream.to_string(),
            events: events.to_vec(),
            sequence_token: token.cloned(),
            returned_token: None,
            accepted: false,
        };

        let result = if let Some(err) = state.injected_failures.pop_front() {
            Err(err)
        } else {
            match state
                .groups
                .get_mut(group)
                .and_then(|g| g.streams.get_mut(stream))
            {
                None => Err(LogServiceError::LogGroupNotFound {
                    group: group.to_string(),
                    message: format!("log stream {stream} does not exist"),
                }),
                Some(target) if target.token.as_ref() != token => {
                    Err(LogServiceError::InvalidSequenceToken {
                        expected: target.token.clone(),
                        message: format!(
                            "the given sequence token is invalid, expected {}",
                            target.token.as_ref().map_or("null", SequenceToken::as_str)
                        ),
                    })
                }
                Some(target) => {
                    state.issued_tokens += 1;
                    let issued = SequenceToken::new(format!("token-{}", state.issued_tokens));
                    target.events.extend_from_slice(events);
                    target.token = Some(issued.clone());
                    Ok(Some(issued))
                }
            }
        };

        if let Ok(returned) = &result {
            call.returned_token = returned.clone();
            call.accepted = true;
        }
        state.calls.push(call);
        drop(guard);
        self.put_notify.notify_waiters();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_must_be_threaded() {
        let service = MemoryLogService::new().with_stream("/g", "s", None);
        let first = service
            .put_log_events("/g", "s", &[LogEvent::new("a", 1)], None)
            .await
            .unwrap();
        assert_eq!(first, Some(SequenceToken::from("token-1")));

        let err = service
            .put_log_events("/g", "s", &[LogEvent::new("b", 2)], None)
            .await
            .unwrap_err();
        assert_eq!(err.expected_token(), first.as_ref());

        service
            .put_log_events("/g", "s", &[LogEvent::new("b", 2)], first.as_ref())
            .await
            .unwrap();
        assert_eq!(
            service.events("/g", "s"),
            vec![LogEvent::new("a", 1), LogEvent::new("b", 2)]
        );
        assert_eq!(service.put_calls().len(), 3);
    }

    #[tokio::test]
    async fn missing_group_is_reported() {
        let service = MemoryLogService::new();
        let err = service.describe_log_streams("/nope", "s").await.unwrap_err();
        assert!(err.is_log_group_not_found());

        service
            .create_log_group("/nope", &[("GeneratedBy", "cloudtee")])
            .await
            .unwrap();
        assert!(service.describe_log_streams("/nope", "s").await.unwrap().is_empty());
        assert_eq!(
            service.group_tags("/nope"),
            vec![("GeneratedBy".to_string(), "cloudtee".to_string())]
        );
    }

    #[tokio::test]
    async fn injected_failure_is_recorded_and_leaves_stream_untouched() {
        let service = MemoryLogService::new().with_stream("/g", "s", Some("seed"));
        service.fail_next_put(LogServiceError::Service {
            operation: "PutLogEvents",
            message: "throttled".to_string(),
        });

        let token = SequenceToken::from("seed");
        assert!(
            service
                .put_log_events("/g", "s", &[LogEvent::new("a", 1)], Some(&token))
                .await
                .is_err()
        );
        assert!(service.events("/g", "s").is_empty());
        assert!(!service.put_calls()[0].accepted);

        service
            .put_log_events("/g", "s", &[LogEvent::new("a", 1)], Some(&token))
            .await
            .unwrap();
        assert_eq!(service.events("/g", "s").len(), 1);
    }
}
