use crate::types::{ExecutionMode, IntentStep, StepType};

/// Step types whose execution path is fully scripted.
pub const DETERMINISTIC_TYPES: [StepType; 3] = [
    StepType::Navigate,
    StepType::SwitchNetwork,
    StepType::VerifyState,
];

/// Whether a step can run without the model. Unknown types are never deterministic.
pub fn is_deterministic(step: &IntentStep) -> bool {
    DETERMINISTIC_TYPES.contains(&step.step_type)
}

pub fn execution_mode(step: &IntentStep) -> ExecutionMode {
    if is_deterministic(step) {
        ExecutionMode::Deterministic
    } else {
        ExecutionMode::Agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step_type: StepType) -> IntentStep {
        IntentStep {
            id: "s".into(),
            description: String::new(),
            step_type,
            source_step_indices: vec![],
            context: None,
        }
    }

    #[test]
    fn only_three_types_are_deterministic() {
        assert!(is_deterministic(&step(StepType::Navigate)));
        assert!(is_deterministic(&step(StepType::SwitchNetwork)));
        assert!(is_deterministic(&step(StepType::VerifyState)));

        for agent_type in [
            StepType::ConnectWallet,
            StepType::SignMessage,
            StepType::ConfirmTransaction,
            StepType::FillForm,
            StepType::ClickElement,
            StepType::DismissObstacle,
            StepType::Other("scroll".into()),
        ] {
            assert_eq!(execution_mode(&step(agent_type)), ExecutionMode::Agent);
        }
    }
}
