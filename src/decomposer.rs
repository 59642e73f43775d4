//! Decomposition of compound requests
//!
//! A request that encodes more than one action is split into a parent
//! operation plus one independently classified child per action. The split
//! is a semantic judgment made by the oracle; there is no pattern-based
//! splitter. When the oracle is unsure which entities a request refers to,
//! a clarification placeholder comes back instead of a guess.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::AtomicClassifier;
use crate::models::{Operation, OperationStatus};
use crate::oracle::{ask, DecompositionReply, Oracle, OracleCall, OracleRequest};

/// Asked when the oracle flags ambiguity without supplying a question.
pub const DEFAULT_CLARIFICATION: &str = "Could you rephrase your request more specifically?";

const SYSTEM_PROMPT: &str = r#"You are an OPERATION DECOMPOSER. Decide whether a user's request contains multiple distinct operations.

MULTIPLE OPERATIONS:
- "Move X and Y to Z" = TWO operations (move X to Z, move Y to Z)
- "Delete the file and restart the service" = TWO operations

SINGLE OPERATION:
- "Show me X"
- "Create a scene about X"
- "Move the X and Y scene" where "X and Y" is one entity name
- Compound nouns and multi-word names are never split

RULES:
- If you are unsure which entities the user means, set needs_clarification
- Only split when you are CONFIDENT the operations are distinct
- Keep entity references exactly as the user wrote them

Return ONLY a JSON object:
{
    "needs_decomposition": true/false,
    "operation_count": number,
    "sub_requests": ["first operation", "second operation"],
    "confident": true/false,
    "reasoning": "why",
    "needs_clarification": true/false,
    "clarification_prompt": "question to ask, if clarification is needed"
}"#;

#[derive(Debug, Clone)]
pub struct DecompositionResult {
    pub original_request: String,
    pub decomposed: bool,
    /// Parent first when `decomposed`, then its children in order.
    pub operations: Vec<Operation>,
    pub reasoning: String,
    pub confident: bool,
    pub needs_clarification: bool,
    pub clarification_prompt: Option<String>,
}

impl DecompositionResult {
    pub fn parent(&self) -> Option<&Operation> {
        if self.decomposed {
            self.operations.first()
        } else {
            None
        }
    }

    pub fn children(&self) -> &[Operation] {
        if self.decomposed {
            &self.operations[1..]
        } else {
            &[]
        }
    }

    /// The question that has to be answered before this result can be used.
    ///
    /// A placeholder always needs one. A split with unsure children needs
    /// one only when the oracle supplied it.
    pub fn clarification_question(&self) -> Option<String> {
        if !self.needs_clarification {
            return None;
        }
        let prompt = self
            .clarification_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        match prompt {
            Some(prompt) => Some(prompt.to_string()),
            None if !self.decomposed => Some(DEFAULT_CLARIFICATION.to_string()),
            None => None,
        }
    }
}

/// A flattened operation tree, parent before children.
///
/// `clarification` is set when some level of the split could not go ahead
/// without asking the user; `operations` is then incomplete and must not
/// be verified.
#[derive(Debug, Clone, Default)]
pub struct OperationTree {
    pub operations: Vec<Operation>,
    pub clarification: Option<String>,
}

/// A child queued for another split, with the analysis that queued it.
struct PendingSplit {
    request: String,
    depth: usize,
    /// Parent index in the flattened tree and the child slot to fill.
    slot: Option<(usize, usize)>,
    analysis: DecompositionReply,
}

pub struct AtomicDecomposer {
    classifier: Arc<AtomicClassifier>,
    oracle: Option<Arc<dyn Oracle>>,
}

impl AtomicDecomposer {
    pub fn new(classifier: Arc<AtomicClassifier>, oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self { classifier, oracle }
    }

    pub fn classifier(&self) -> &AtomicClassifier {
        &self.classifier
    }

    pub async fn decompose(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        parent_id: Option<Uuid>,
        force: bool,
    ) -> DecompositionResult {
        let analysis = self.analyze(request).await;
        self.apply(analysis, request, user_id, source_agent, parent_id, force)
            .await
    }

    async fn apply(
        &self,
        analysis: DecompositionReply,
        request: &str,
        user_id: &str,
        source_agent: &str,
        parent_id: Option<Uuid>,
        force: bool,
    ) -> DecompositionResult {
        if analysis.needs_clarification && !analysis.confident {
            info!(request = %request, "Decomposition needs clarification");
            let mut placeholder = Operation::new(request, user_id, source_agent);
            placeholder.parent_id = parent_id;
            placeholder.status = OperationStatus::AwaitingVerification;

            return DecompositionResult {
                original_request: request.to_string(),
                decomposed: false,
                operations: vec![placeholder],
                reasoning: or_default(analysis.reasoning, "Uncertain decomposition"),
                confident: false,
                needs_clarification: true,
                clarification_prompt: analysis.clarification_prompt,
            };
        }

        let sub_requests: Vec<String> = analysis
            .sub_requests
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if !(force || analysis.needs_decomposition) || sub_requests.len() <= 1 {
            let op = self
                .classified_operation(request, user_id, source_agent, parent_id)
                .await;
            let confident = op.is_confident();
            return DecompositionResult {
                original_request: request.to_string(),
                decomposed: false,
                operations: vec![op],
                reasoning: or_default(analysis.reasoning, "Single atomic operation"),
                confident,
                needs_clarification: false,
                clarification_prompt: None,
            };
        }

        let mut parent = Operation::new(request, user_id, source_agent);
        parent.parent_id = parent_id;

        let mut children = Vec::with_capacity(sub_requests.len());
        for sub_request in &sub_requests {
            children.push(
                self.classified_operation(sub_request, user_id, source_agent, Some(parent.id))
                    .await,
            );
        }

        let all_confident = children.iter().all(Operation::is_confident);
        let needs_clarification = !all_confident;
        parent.decompose_into(children.iter().map(|c| c.id).collect());

        info!(
            parent_id = %parent.id,
            children = children.len(),
            all_confident,
            "Request decomposed"
        );

        let reasoning = or_default(
            analysis.reasoning,
            &format!("Split into {} sub-operations", children.len()),
        );
        let mut operations = Vec::with_capacity(children.len() + 1);
        operations.push(parent);
        operations.extend(children);

        DecompositionResult {
            original_request: request.to_string(),
            decomposed: true,
            operations,
            reasoning,
            confident: all_confident && analysis.confident,
            needs_clarification,
            clarification_prompt: if needs_clarification {
                analysis.clarification_prompt
            } else {
                None
            },
        }
    }

    /// Whether the oracle would split `request`. Always false without one.
    pub async fn needs_decomposition(&self, request: &str) -> bool {
        self.analyze(request).await.needs_decomposition
    }

    /// Decompose recursively up to `max_depth` levels and flatten the tree.
    pub async fn create_operation_tree(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        max_depth: usize,
    ) -> OperationTree {
        if max_depth == 0 {
            return OperationTree {
                operations: vec![
                    self.classified_operation(request, user_id, source_agent, None)
                        .await,
                ],
                clarification: None,
            };
        }
        let root = self
            .decompose(request, user_id, source_agent, None, false)
            .await;
        if let Some(question) = root.clarification_question() {
            return OperationTree {
                operations: root.operations,
                clarification: Some(question),
            };
        }
        self.expand_tree(root.operations, user_id, source_agent, max_depth)
            .await
    }

    /// Flatten a first-level decomposition into a full tree.
    ///
    /// Children that still look compound or ambiguous are queued and split
    /// under their immediate parent; the subtree root takes the child's slot
    /// in the parent's `child_ids`, so sibling order is preserved. Children
    /// at the depth limit stay the leaves they were classified as. The walk
    /// stops at the first level that needs a clarification.
    pub async fn expand_tree(
        &self,
        first_level: Vec<Operation>,
        user_id: &str,
        source_agent: &str,
        max_depth: usize,
    ) -> OperationTree {
        let mut operations: Vec<Operation> = Vec::new();
        let mut queue: VecDeque<PendingSplit> = VecDeque::new();

        self.settle(first_level, 0, None, max_depth, &mut operations, &mut queue)
            .await;

        while let Some(pending) = queue.pop_front() {
            let parent_id = pending.slot.map(|(index, _)| operations[index].id);

            let produced = self
                .apply(
                    pending.analysis,
                    &pending.request,
                    user_id,
                    source_agent,
                    parent_id,
                    false,
                )
                .await;

            if let Some(question) = produced.clarification_question() {
                info!(
                    request = %pending.request,
                    depth = pending.depth,
                    "Nested request needs clarification"
                );
                return OperationTree {
                    operations,
                    clarification: Some(question),
                };
            }

            self.settle(
                produced.operations,
                pending.depth,
                pending.slot,
                max_depth,
                &mut operations,
                &mut queue,
            )
            .await;
        }

        OperationTree {
            operations,
            clarification: None,
        }
    }

    /// Place one decomposition's output into the flattened tree.
    async fn settle(
        &self,
        mut produced: Vec<Operation>,
        depth: usize,
        slot: Option<(usize, usize)>,
        max_depth: usize,
        operations: &mut Vec<Operation>,
        queue: &mut VecDeque<PendingSplit>,
    ) {
        if let (Some((parent_index, child_slot)), Some(root)) = (slot, produced.first()) {
            operations[parent_index].child_ids[child_slot] = root.id;
        }

        if !produced.first().is_some_and(|op| op.is_decomposed) {
            operations.append(&mut produced);
            return;
        }

        let mut iter = produced.into_iter();
        let Some(parent) = iter.next() else {
            return;
        };
        let parent_index = operations.len();
        operations.push(parent);

        let child_depth = depth + 1;
        for (child_slot, child) in iter.enumerate() {
            if child_depth >= max_depth {
                debug!(depth = child_depth, "Depth limit reached, keeping child as a leaf");
                operations.push(child);
                continue;
            }

            let analysis = self.analyze(&child.user_request).await;
            if analysis.needs_decomposition || analysis.needs_clarification {
                queue.push_back(PendingSplit {
                    request: child.user_request,
                    depth: child_depth,
                    slot: Some((parent_index, child_slot)),
                    analysis,
                });
            } else {
                operations.push(child);
            }
        }
    }

    async fn classified_operation(
        &self,
        request: &str,
        user_id: &str,
        source_agent: &str,
        parent_id: Option<Uuid>,
    ) -> Operation {
        let outcome = self.classifier.classify(request, &[], None).await;
        let mut op = Operation::new(request, user_id, source_agent);
        op.parent_id = parent_id;
        op.classify(outcome.classification);
        op
    }

    async fn analyze(&self, request: &str) -> DecompositionReply {
        let Some(oracle) = &self.oracle else {
            return DecompositionReply {
                reasoning: "No oracle available for decomposition analysis".to_string(),
                ..Default::default()
            };
        };

        let user = format!(
            "USER REQUEST: \"{}\"\n\nDoes this contain multiple distinct operations? If yes, what are they?",
            request
        );
        let call = OracleRequest::new(OracleCall::Decomposition, SYSTEM_PROMPT, user);

        match ask::<DecompositionReply>(oracle.as_ref(), &call).await {
            Ok(reply) => {
                debug!(
                    needs_decomposition = reply.needs_decomposition,
                    sub_requests = reply.sub_requests.len(),
                    confident = reply.confident,
                    "Decomposition analysis"
                );
                reply
            }
            Err(e) => {
                warn!(error = %e, "Decomposition analysis failed, treating request as atomic");
                DecompositionReply {
                    reasoning: format!("Decomposition analysis failed: {}", e),
                    ..Default::default()
                }
            }
        }
    }
}

fn or_default(reasoning: String, default: &str) -> String {
    if reasoning.trim().is_empty() {
        default.to_string()
    } else {
        reasoning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockOracle;

    const NO_SPLIT: &str = r#"{"needs_decomposition": false, "sub_requests": [], "confident": true, "reasoning": "single action"}"#;

    fn create_test_decomposer(oracle: Option<MockOracle>) -> AtomicDecomposer {
        let oracle = oracle.map(|o| Arc::new(o) as Arc<dyn Oracle>);
        AtomicDecomposer::new(Arc::new(AtomicClassifier::new(None)), oracle)
    }

    fn quoted(request: &str) -> String {
        format!("\"{}\"", request)
    }

    #[tokio::test]
    async fn test_no_split_returns_request_verbatim() {
        let decomposer =
            create_test_decomposer(Some(MockOracle::new().reply(OracleCall::Decomposition, NO_SPLIT)));
        let request = "  show me my calendar ";

        let result = decomposer.decompose(request, "u1", "cairn", None, false).await;

        assert!(!result.decomposed);
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].user_request, request);
        assert_eq!(result.operations[0].status, OperationStatus::AwaitingVerification);
        assert!(result.operations[0].classification.is_some());
        assert_eq!(result.reasoning, "single action");
    }

    #[tokio::test]
    async fn test_two_scene_move_splits() {
        let oracle = MockOracle::new().reply(
            OracleCall::Decomposition,
            r#"{"needs_decomposition": true, "operation_count": 2,
                "sub_requests": ["move the job-search scene to archive", "move the career scene to archive", "  "],
                "confident": true, "reasoning": "two scenes"}"#,
        );
        let decomposer = create_test_decomposer(Some(oracle));

        let result = decomposer
            .decompose(
                "move the job-search scene and the career scene to archive",
                "u1",
                "cairn",
                None,
                false,
            )
            .await;

        assert!(result.decomposed);
        assert_eq!(result.operations.len(), 3);
        let parent = result.parent().unwrap();
        assert!(parent.is_decomposed);
        assert_eq!(parent.status, OperationStatus::Decomposed);
        assert!(parent.classification.is_none());
        assert_eq!(parent.child_ids.len(), 2);
        for child in result.children() {
            assert_eq!(child.parent_id, Some(parent.id));
            assert!(child.classification.is_some());
            assert!(parent.child_ids.contains(&child.id));
        }
        // Keyword fallback is never confident, so the split is not either.
        assert!(!result.confident);
        assert!(result.needs_clarification);
        assert!(parent.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_ambiguous_request_returns_placeholder() {
        let oracle = MockOracle::new().reply(
            OracleCall::Decomposition,
            r#"{"needs_decomposition": false, "confident": false, "needs_clarification": true,
                "clarification_prompt": "Which two scenes do you mean?"}"#,
        );
        let decomposer = create_test_decomposer(Some(oracle));

        let result = decomposer
            .decompose("move those two scenes to Career", "u1", "cairn", None, false)
            .await;

        assert!(result.needs_clarification);
        assert_eq!(
            result.clarification_prompt.as_deref(),
            Some("Which two scenes do you mean?")
        );
        let placeholder = &result.operations[0];
        assert!(placeholder.classification.is_none());
        assert_eq!(placeholder.status, OperationStatus::AwaitingVerification);
    }

    #[tokio::test]
    async fn test_oracle_failure_and_absence_are_atomic() {
        let decomposer =
            create_test_decomposer(Some(MockOracle::new().fail(OracleCall::Decomposition, "down")));
        let result = decomposer.decompose("a and b", "u1", "cairn", None, true).await;
        assert!(!result.decomposed);
        assert!(!result.needs_clarification);

        let decomposer = create_test_decomposer(None);
        assert!(!decomposer.needs_decomposition("a and b").await);
    }

    #[tokio::test]
    async fn test_operation_tree_recurses_and_keeps_order() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the garage and wash the car, then call mom"),
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the garage and wash the car", "call mom"], "confident": true}"#,
            )
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the garage and wash the car"),
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the garage", "wash the car"], "confident": true}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT);
        let decomposer = create_test_decomposer(Some(oracle));

        let tree = decomposer
            .create_operation_tree(
                "tidy the garage and wash the car, then call mom",
                "u1",
                "cairn",
                3,
            )
            .await;
        assert!(tree.clarification.is_none());
        let ops = tree.operations;

        assert_eq!(ops.len(), 5);
        let root = &ops[0];
        assert!(root.is_decomposed);
        assert_eq!(root.parent_id, None);

        let find = |id: Uuid| ops.iter().find(|op| op.id == id).unwrap();
        let first = find(root.child_ids[0]);
        let second = find(root.child_ids[1]);
        assert_eq!(first.user_request, "tidy the garage and wash the car");
        assert!(first.is_decomposed);
        assert_eq!(first.parent_id, Some(root.id));
        assert_eq!(second.user_request, "call mom");

        let grandchildren: Vec<&str> = first
            .child_ids
            .iter()
            .map(|id| find(*id).user_request.as_str())
            .collect();
        assert_eq!(grandchildren, vec!["tidy the garage", "wash the car"]);
        for id in &first.child_ids {
            assert_eq!(find(*id).parent_id, Some(first.id));
        }
    }

    #[tokio::test]
    async fn test_operation_tree_depth_limit() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the garage and wash the car, then call mom"),
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the garage and wash the car", "call mom"], "confident": true}"#,
            )
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the garage and wash the car"),
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the garage", "wash the car"], "confident": true}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT);
        let decomposer = create_test_decomposer(Some(oracle));

        let ops = decomposer
            .create_operation_tree(
                "tidy the garage and wash the car, then call mom",
                "u1",
                "cairn",
                1,
            )
            .await
            .operations;

        assert_eq!(ops.len(), 3);
        let leaf = ops
            .iter()
            .find(|op| op.user_request == "tidy the garage and wash the car")
            .unwrap();
        assert!(!leaf.is_decomposed);
        assert!(leaf.classification.is_some());
        assert_eq!(ops[0].child_ids[0], leaf.id);

        let ops = decomposer
            .create_operation_tree("call mom", "u1", "cairn", 0)
            .await
            .operations;
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn test_nested_ambiguity_stops_the_tree() {
        let oracle = MockOracle::new()
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the thing and call mom"),
                r#"{"needs_decomposition": true, "sub_requests": ["tidy the thing", "call mom"], "confident": true}"#,
            )
            .reply_when(
                OracleCall::Decomposition,
                quoted("tidy the thing"),
                r#"{"needs_decomposition": false, "confident": false, "needs_clarification": true,
                    "clarification_prompt": "Which thing do you mean?"}"#,
            )
            .reply(OracleCall::Decomposition, NO_SPLIT);
        let decomposer = create_test_decomposer(Some(oracle));

        let tree = decomposer
            .create_operation_tree("tidy the thing and call mom", "u1", "cairn", 3)
            .await;

        assert_eq!(tree.clarification.as_deref(), Some("Which thing do you mean?"));
        assert!(tree
            .operations
            .iter()
            .all(|op| op.user_request != "tidy the thing"));
    }

    #[tokio::test]
    async fn test_children_at_depth_limit_are_not_analyzed() {
        let oracle = Arc::new(
            MockOracle::new()
                .reply_when(
                    OracleCall::Decomposition,
                    quoted("show cpu and show disk"),
                    r#"{"needs_decomposition": true, "sub_requests": ["show cpu", "show disk"], "confident": true}"#,
                )
                .reply(OracleCall::Decomposition, NO_SPLIT),
        );
        let decomposer = AtomicDecomposer::new(
            Arc::new(AtomicClassifier::new(None)),
            Some(oracle.clone() as Arc<dyn Oracle>),
        );

        let tree = decomposer
            .create_operation_tree("show cpu and show disk", "u1", "cairn", 1)
            .await;

        assert_eq!(tree.operations.len(), 3);
        assert_eq!(oracle.calls(), vec![OracleCall::Decomposition]);
    }

    #[test]
    fn test_clarification_question_defaults_for_placeholder() {
        let placeholder = DecompositionResult {
            original_request: "move those".into(),
            decomposed: false,
            operations: vec![Operation::new("move those", "u1", "cairn")],
            reasoning: String::new(),
            confident: false,
            needs_clarification: true,
            clarification_prompt: Some("  ".into()),
        };
        assert_eq!(
            placeholder.clarification_question().as_deref(),
            Some(DEFAULT_CLARIFICATION)
        );

        let split = DecompositionResult {
            decomposed: true,
            clarification_prompt: None,
            ..placeholder
        };
        assert_eq!(split.clarification_question(), None);
    }
}
