//! Flow validation.
//!
//! Runs before a flow is persisted or bound to a session. Structural
//! problems are errors and reject the flow; states unreachable from `start`
//! are accepted with warnings.

use super::{FlowConfig, StateDef, TransitionSpec};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("flow is missing meta")]
    MissingMeta,
    #[error("flow is missing a start state")]
    MissingStart,
    #[error("flow has no states")]
    NoStates,
    #[error("start state `{0}` is not defined")]
    UnknownStart(String),
    #[error("state `{state}`: transition targets unknown state `{to}`")]
    UnknownTarget { state: String, to: String },
    #[error("state `{state}`: transition references unknown intent `{intent}`")]
    UnknownIntent { state: String, intent: String },
    #[error("state `{state}`: onEnter references unknown tool `{tool}`")]
    UnknownTool { state: String, tool: String },
    #[error("state `{state}`: action must contain exactly one of say, ask, transfer, hangup, tool")]
    MalformedAction { state: String },
    #[error("state `{state}`: transition has none of onIntent, onToolResult, branch")]
    MissingTrigger { state: String },
    #[error("state `{state}`: transition has no `to` and no `branch`")]
    MissingTarget { state: String },
    #[error("tool `{tool}`: timeout_ms must be numeric")]
    BadTimeout { tool: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    #[error("state `{0}` is unreachable from start")]
    Unreachable(String),
}

/// Validate a flow. On success returns the (possibly empty) warning list;
/// on failure returns every error found.
pub fn validate(flow: &FlowConfig) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if flow.meta.is_none() {
        errors.push(ValidationError::MissingMeta);
    }
    if flow.start.is_empty() {
        errors.push(ValidationError::MissingStart);
    }
    if flow.states.is_empty() {
        errors.push(ValidationError::NoStates);
    } else if !flow.start.is_empty() && !flow.states.contains_key(&flow.start) {
        errors.push(ValidationError::UnknownStart(flow.start.clone()));
    }

    for (tool, def) in &flow.tools {
        if let Some(timeout) = &def.timeout_ms {
            if !timeout.is_number() {
                errors.push(ValidationError::BadTimeout { tool: tool.clone() });
            }
        }
    }

    for (name, state) in &flow.states {
        check_actions(flow, name, state, &mut errors);
        for transition in &state.transitions {
            check_transition(flow, name, transition, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(unreachable_states(flow))
    } else {
        Err(errors)
    }
}

fn check_actions(
    flow: &FlowConfig,
    name: &str,
    state: &StateDef,
    errors: &mut Vec<ValidationError>,
) {
    for action in &state.on_enter {
        match action.kind() {
            None => errors.push(ValidationError::MalformedAction {
                state: name.to_string(),
            }),
            Some(super::Action::Tool { name: tool, .. }) => {
                if !flow.tools.contains_key(tool) {
                    errors.push(ValidationError::UnknownTool {
                        state: name.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
            Some(_) => {}
        }
    }
}

fn check_transition(
    flow: &FlowConfig,
    name: &str,
    transition: &TransitionSpec,
    errors: &mut Vec<ValidationError>,
) {
    if transition.on_intent.is_none()
        && transition.on_tool_result.is_none()
        && transition.branch.is_none()
    {
        errors.push(ValidationError::MissingTrigger {
            state: name.to_string(),
        });
    }

    if let Some(intents) = &transition.on_intent {
        for intent in intents.iter() {
            if !flow.intents.contains_key(intent) {
                errors.push(ValidationError::UnknownIntent {
                    state: name.to_string(),
                    intent: intent.to_string(),
                });
            }
        }
    }

    match &transition.branch {
        Some(arms) => {
            for arm in arms {
                if !flow.states.contains_key(&arm.to) {
                    errors.push(ValidationError::UnknownTarget {
                        state: name.to_string(),
                        to: arm.to.clone(),
                    });
                }
            }
        }
        None => match &transition.to {
            Some(to) if !flow.states.contains_key(to) => {
                errors.push(ValidationError::UnknownTarget {
                    state: name.to_string(),
                    to: to.clone(),
                });
            }
            Some(_) => {}
            None => errors.push(ValidationError::MissingTarget {
                state: name.to_string(),
            }),
        },
    }

    // `branch` wins over `to`, but a `to` alongside a branch must still
    // point at a real state.
    if transition.branch.is_some() {
        if let Some(to) = &transition.to {
            if !flow.states.contains_key(to) {
                errors.push(ValidationError::UnknownTarget {
                    state: name.to_string(),
                    to: to.clone(),
                });
            }
        }
    }
}

/// Forward traversal from `start` over `to` targets and branch arms.
fn unreachable_states(flow: &FlowConfig) -> Vec<ValidationWarning> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(flow.start.as_str());
    queue.push_back(flow.start.as_str());

    while let Some(name) = queue.pop_front() {
        let Some(state) = flow.states.get(name) else {
            continue;
        };
        for transition in &state.transitions {
            let mut targets: Vec<&str> = Vec::new();
            if let Some(arms) = &transition.branch {
                targets.extend(arms.iter().map(|a| a.to.as_str()));
            } else if let Some(to) = &transition.to {
                targets.push(to.as_str());
            }
            for target in targets {
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }

    flow.states
        .keys()
        .filter(|name| !seen.contains(name.as_str()))
        .map(|name| ValidationWarning::Unreachable(name.clone()))
        .collect()
}
