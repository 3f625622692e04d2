//! Active calls indexed by Call-ID

use super::call::Call;
use super::message::SipMessage;
use std::collections::HashMap;

#[derive(Default)]
pub struct CallRegistry {
    calls: HashMap<String, Call>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: Call) {
        self.calls.insert(call.id().to_string(), call);
    }

    pub fn get(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut Call> {
        self.calls.get_mut(call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn remove(&mut self, call_id: &str) -> Option<Call> {
        self.calls.remove(call_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.calls.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Call that should see `message`: the owner of the matching
    /// transaction, otherwise the dialog with the same Call-ID.
    pub fn route(&self, message: &SipMessage) -> Option<String> {
        if !message.is_request() {
            if let Some(call) = self.calls.values().find(|c| c.owns_response(message)) {
                return Some(call.id().to_string());
            }
        }
        let call_id = message.call_id()?;
        self.calls.contains_key(call_id).then(|| call_id.to_string())
    }

    /// Remove and return every call in the Finished state
    pub fn reap_finished(&mut self) -> Vec<Call> {
        let finished: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.state().is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        finished
            .into_iter()
            .filter_map(|id| self.calls.remove(&id))
            .collect()
    }
}
