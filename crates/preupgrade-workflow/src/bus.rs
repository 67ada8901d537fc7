use preupgrade_domain::{Dialog, ErrorEntry, Message, ModelType, ReportEntry};

/// Append-only, run-scoped message log.
#[derive(Debug, Default)]
pub struct MessageBus {
    messages: Vec<Message>,
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed messages of `model`, in commit order, as of this call.
    pub fn consume<'a>(&'a self, model: &ModelType) -> impl Iterator<Item = &'a Message> + 'a {
        let model = model.clone();
        self.messages
            .iter()
            .filter(move |message| message.model == model)
    }

    /// Append a finished actor's staged messages. Returns how many were appended.
    pub fn commit(&mut self, messages: Vec<Message>) -> usize {
        let count = messages.len();
        self.messages.extend(messages);
        count
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Output of one actor that is not yet visible to anyone else.
#[derive(Debug, Default)]
pub struct StagedOutput {
    pub messages: Vec<Message>,
    pub reports: Vec<ReportEntry>,
    pub errors: Vec<ErrorEntry>,
    pub dialogs: Vec<Dialog>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(model: &str, value: i64) -> Message {
        Message::new(ModelType::new(model), json!({ "value": value }))
    }

    #[test]
    fn consume_filters_by_model_and_is_restartable() {
        let mut bus = MessageBus::new();
        bus.commit(vec![message("A", 1), message("B", 2), message("A", 3)]);
        let model = ModelType::new("A");

        let first: Vec<i64> = bus
            .consume(&model)
            .filter_map(|message| message.payload["value"].as_i64())
            .collect();
        let second: Vec<i64> = bus
            .consume(&model)
            .filter_map(|message| message.payload["value"].as_i64())
            .collect();
        assert_eq!(first, vec![1, 3]);
        assert_eq!(first, second);
    }

    #[test]
    fn commit_appends_without_touching_existing_messages() {
        let mut bus = MessageBus::new();
        assert!(bus.is_empty());
        assert_eq!(bus.commit(vec![message("A", 1)]), 1);
        assert_eq!(bus.commit(vec![message("A", 2), message("A", 3)]), 2);
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.messages()[0].payload, json!({ "value": 1 }));
    }
}
