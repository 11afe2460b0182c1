use tabpilot_core_types::CommandOutcome;

/// Events the executor publishes for the bridge (and tests) to observe.
/// Emission is serialized with command execution: a `StateChanged` seen
/// after a `CommandResult` reflects at least that command's completion.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    CommandResult {
        command_id: String,
        result: CommandOutcome,
    },
    StateChanged,
}
