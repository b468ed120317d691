// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

/// Build the system prompt for one task: role framing plus the directory
/// context tools will run in.
pub fn system_prompt(goal: &str, working_dir: &Path) -> String {
    format!(
        "You are alex, an autonomous software engineering agent.\n\
         \n\
         You work by calling tools: inspect the project, make changes, and verify \
         them. Call one or more tools whenever you need information or side effects; \
         reply with plain text only when the task is complete. Tool arguments must be \
         valid JSON matching each tool's schema. Paths are relative to the working \
         directory unless absolute.\n\
         \n\
         Working directory: {}\n\
         \n\
         Current task:\n{}",
        working_dir.display(),
        goal
    )
}
