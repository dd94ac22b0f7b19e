// src/rotation/prompt.rs
//! Continuation prompt for a rotated run

/// Frame the original task and the tail of the previous session's output
pub fn continuation_prompt(task: &str, recent_output: &[String]) -> String {
    let output = if recent_output.is_empty() {
        "(no output was captured before the handoff)".to_string()
    } else {
        recent_output.join("\n")
    };

    format!(
        "You are continuing a task that was started in a previous session. \
         That session was handed off to a fresh account before it finished.\n\
         \n\
         ## Original task\n\
         \n\
         {task}\n\
         \n\
         ## Output from the previous session (last {count} lines)\n\
         \n\
         ```\n\
         {output}\n\
         ```\n\
         \n\
         Use the output above to work out what has already been done. \
         Do not repeat completed work: pick up where the previous session stopped \
         and finish the original task.",
        task = task.trim(),
        count = recent_output.len(),
        output = output,
    )
}
