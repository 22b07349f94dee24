use shared::protocol::{ChildSummary, ConversationSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct ChildGroup {
    pub child: ChildSummary,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidebar {
    /// Conversations with no child, or with a child that is not in the
    /// current children list.
    pub general: Vec<ConversationSummary>,
    pub by_child: Vec<ChildGroup>,
}

impl Sidebar {
    pub fn group_for(&self, child_id: &str) -> Option<&ChildGroup> {
        self.by_child
            .iter()
            .find(|group| group.child.id.as_str() == child_id)
    }
}

pub fn group_conversations(
    conversations: &[ConversationSummary],
    children: &[ChildSummary],
) -> Sidebar {
    let mut sidebar = Sidebar {
        general: Vec::new(),
        by_child: children
            .iter()
            .map(|child| ChildGroup {
                child: child.clone(),
                conversations: Vec::new(),
            })
            .collect(),
    };

    for conversation in conversations {
        let bucket = conversation.child_id.as_ref().and_then(|child_id| {
            sidebar
                .by_child
                .iter_mut()
                .find(|group| group.child.id == *child_id)
        });
        match bucket {
            Some(group) => group.conversations.push(conversation.clone()),
            None => sidebar.general.push(conversation.clone()),
        }
    }

    sort_recent_first(&mut sidebar.general);
    for group in &mut sidebar.by_child {
        sort_recent_first(&mut group.conversations);
    }
    sidebar
}

fn sort_recent_first(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation(body: serde_json::Value) -> ConversationSummary {
        serde_json::from_value(body).expect("conversation")
    }

    fn children() -> Vec<ChildSummary> {
        serde_json::from_value(json!([
            { "id": 7, "name": "Mia" },
            { "id": "9", "name": "Leo" }
        ]))
        .expect("children")
    }

    #[test]
    fn string_child_id_matches_numeric_child() {
        let sidebar = group_conversations(
            &[conversation(json!({ "id": 1, "title": "Naps", "childId": "7" }))],
            &children(),
        );

        assert!(sidebar.general.is_empty());
        let mia = sidebar.group_for("7").expect("mia bucket");
        assert_eq!(mia.child.name, "Mia");
        assert_eq!(mia.conversations.len(), 1);
    }

    #[test]
    fn unmatched_and_missing_children_land_in_general() {
        let sidebar = group_conversations(
            &[
                conversation(json!({ "id": 1, "title": "General" })),
                conversation(json!({ "id": 2, "title": "Orphan", "child_id": 404 })),
                conversation(json!({ "id": 3, "title": "Leo", "child_id": 9 })),
            ],
            &children(),
        );

        let general: Vec<&str> = sidebar.general.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(general.len(), 2);
        assert!(general.contains(&"1") && general.contains(&"2"));
        assert_eq!(sidebar.group_for("9").map(|g| g.conversations.len()), Some(1));
        assert_eq!(sidebar.group_for("7").map(|g| g.conversations.len()), Some(0));
    }

    #[test]
    fn buckets_are_sorted_most_recent_first() {
        let sidebar = group_conversations(
            &[
                conversation(json!({ "id": 1, "updatedAt": "2024-03-01T10:00:00Z" })),
                conversation(json!({ "id": 2 })),
                conversation(json!({ "id": 3, "updated_at": "2024-03-02T10:00:00Z" })),
            ],
            &[],
        );
        let order: Vec<&str> = sidebar.general.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["3", "1", "2"]);
    }
}
