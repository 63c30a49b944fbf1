//! Heuristic continuation generator: classifies the Agent's last response
//! and produces either a continuation prompt or a stop signal, keeping a
//! task moving autonomously outside chat mode.
//!
//! Selection among templates/choices is deterministic (derived from
//! `task_id` + `iteration`) rather than `rand`-based, so runs reproduce.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseType {
    MultipleChoice(Vec<String>),
    YesNoQuestion,
    OpenQuestion,
    Error,
    Completion,
    Continuation,
}

static QUESTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\?",
        r"should i",
        r"would you like",
        r"do you want",
        r"which (?:one|approach|option|method)",
        r"(?:prefer|choose|select)",
        r"let me know",
        r"what (?:should|would)",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static COMPLETION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["completed", "finished", "done", "implemented", "successfully", "all tests? pass", "ready"]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
        .collect()
});

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["error", "failed", "exception", "cannot", "unable", "issue", "problem", "bug"]
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
        .collect()
});

static NUMBERED_CHOICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)[:.)\]]\s*\S").unwrap());
static LETTERED_CHOICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\[([a-zA-Z])\]\s*\S").unwrap());

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

pub fn extract_choices(text: &str) -> Vec<String> {
    let numbered: Vec<String> = NUMBERED_CHOICE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    if !numbered.is_empty() {
        return numbered.into_iter().take(10).collect();
    }
    LETTERED_CHOICE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .take(10)
        .collect()
}

pub fn classify(response: &str) -> ResponseType {
    let has_error = any_match(&ERROR_PATTERNS, response);
    if has_error {
        return ResponseType::Error;
    }

    let seems_complete = any_match(&COMPLETION_PATTERNS, response);
    if seems_complete {
        return ResponseType::Completion;
    }

    let choices = extract_choices(response);
    if !choices.is_empty() {
        return ResponseType::MultipleChoice(choices);
    }

    if any_match(&QUESTION_PATTERNS, response) {
        let lower = response.to_lowercase();
        if ["how", "what", "where", "which"].iter().any(|w| lower.contains(w)) {
            return ResponseType::OpenQuestion;
        }
        return ResponseType::YesNoQuestion;
    }

    ResponseType::Continuation
}

/// Deterministic stand-in for `random.choice`/`random.random()`: stable for
/// a given (task, iteration), varies across iterations and tasks.
fn deterministic_index(task_id: &str, iteration: u32, modulus: usize) -> usize {
    if modulus == 0 {
        return 0;
    }
    let byte_sum: u64 = task_id.bytes().map(u64::from).sum();
    ((byte_sum.wrapping_mul(31).wrapping_add(iteration as u64)) as usize) % modulus
}

fn pick<'a>(templates: &[&'a str], task_id: &str, iteration: u32) -> &'a str {
    templates[deterministic_index(task_id, iteration, templates.len())]
}

fn respond_to_choice(choices: &[String], task_id: &str, iteration: u32) -> String {
    if choices.is_empty() {
        return "Please proceed with your best judgment.".to_string();
    }

    let selected = if choices.len() >= 3 {
        match deterministic_index(task_id, iteration, 10) {
            0..=3 => &choices[0],
            4..=7 => &choices[choices.len() / 2],
            _ => &choices[choices.len() - 1],
        }
    } else {
        &choices[0]
    };

    let templates = [
        format!("Let's go with option {selected}. Please proceed with that approach."),
        format!("Option {selected} sounds good. Please implement that."),
        format!("I'd prefer option {selected}. Continue with that approach."),
        format!("Please proceed with option {selected}."),
    ];
    let refs: Vec<&str> = templates.iter().map(String::as_str).collect();
    pick(&refs, task_id, iteration).to_string()
}

fn respond_to_yes_no(response: &str, task_id: &str, iteration: u32) -> String {
    let lower = response.to_lowercase();
    let implementation_keywords = ["implement", "add", "create", "should i", "would you like"];
    let templates: &[&str] = if implementation_keywords.iter().any(|k| lower.contains(k)) {
        &[
            "Yes, please proceed with that.",
            "Yes, that sounds good. Please continue.",
            "Yes, go ahead with the implementation.",
            "Yes, please implement that feature.",
            "That would be great. Please proceed.",
        ]
    } else {
        &[
            "Yes, please continue.",
            "That works. Please proceed.",
            "Sounds good. Keep going.",
            "Yes, go ahead.",
        ]
    };
    pick(templates, task_id, iteration).to_string()
}

fn respond_to_open_question(response: &str) -> String {
    let lower = response.to_lowercase();
    if lower.contains("how") {
        "Please use your best judgment based on best practices. Proceed with what you think is best.".to_string()
    } else if lower.contains("what") {
        "Choose the approach that follows industry best practices. Continue with your recommendation.".to_string()
    } else if lower.contains("where") {
        "Place it where it makes the most sense organizationally. Use standard conventions for the project.".to_string()
    } else if lower.contains("which") {
        "Select the option that is most maintainable and follows best practices. Proceed with that.".to_string()
    } else {
        "Use your best judgment and proceed with the implementation. Follow standard best practices.".to_string()
    }
}

fn respond_to_error(task_id: &str, iteration: u32) -> String {
    let templates = [
        "I see the error. Please try an alternative approach and continue.",
        "Let's work around that issue. Please try a different method.",
        "Please resolve the error using an alternative approach, then continue with the task.",
        "Try to fix the error and proceed. Use a different approach if needed.",
        "Please address the error and continue with the implementation.",
    ];
    pick(&templates, task_id, iteration).to_string()
}

fn respond_to_completion(task_id: &str, iteration: u32) -> String {
    let templates = [
        "Great! Please make sure everything is complete and all tests pass.",
        "Excellent work. Please verify everything is working correctly.",
        "Good job! Please double-check the implementation and run any tests.",
        "Nice! Please ensure the implementation is production-ready.",
        "Well done. Please make a final review and confirm completion.",
    ];
    pick(&templates, task_id, iteration).to_string()
}

fn respond_general_continuation(task_id: &str, iteration: u32) -> String {
    let templates: &[&str] = if iteration < 5 {
        &[
            "Please continue with the implementation.",
            "Keep going. Please proceed with the next steps.",
            "Continue with the task.",
            "Please move forward with the implementation.",
        ]
    } else if iteration < 10 {
        &[
            "Good progress. Please continue with the remaining work.",
            "You're making good progress. Keep going.",
            "Nice work so far. Please finish the remaining tasks.",
            "Excellent. Please complete the remaining implementation.",
        ]
    } else {
        &[
            "We're getting close. Please finish up the remaining work.",
            "Almost there. Please complete the final tasks.",
            "Great progress. Please wrap up the implementation.",
            "Nearly done. Please finalize everything.",
        ]
    };
    pick(templates, task_id, iteration).to_string()
}

/// Generates the next continuation message for a response the core has
/// already decided to keep driving (see `should_continue`).
pub fn generate_response(response: &str, task_id: &str, iteration: u32) -> String {
    match classify(response) {
        ResponseType::MultipleChoice(choices) => respond_to_choice(&choices, task_id, iteration),
        ResponseType::YesNoQuestion => respond_to_yes_no(response, task_id, iteration),
        ResponseType::OpenQuestion => respond_to_open_question(response),
        ResponseType::Error => respond_to_error(task_id, iteration),
        ResponseType::Completion => respond_to_completion(task_id, iteration),
        ResponseType::Continuation => respond_general_continuation(task_id, iteration),
    }
}

/// `false` is equivalent to completion detection: the executor treats it as
/// a "stop" decision (extract summary, break the loop).
pub fn should_continue(response: &str, iteration: u32, max_iterations: u32) -> bool {
    if iteration >= max_iterations {
        return false;
    }
    let has_question = any_match(&QUESTION_PATTERNS, response);
    let seems_complete = any_match(&COMPLETION_PATTERNS, response);
    !(seems_complete && !has_question)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_over_everything_else() {
        let resp = "I finished the task but got an error: cannot open file. Should I retry?";
        assert_eq!(classify(resp), ResponseType::Error);
    }

    #[test]
    fn classifies_completion_when_no_error() {
        assert_eq!(classify("All tests pass, implementation is done."), ResponseType::Completion);
    }

    #[test]
    fn classifies_multiple_choice() {
        let resp = "I see two approaches:\n1. Use a cache\n2. Recompute every time\nWhich do you prefer?";
        match classify(resp) {
            ResponseType::MultipleChoice(choices) => assert_eq!(choices, vec!["1", "2"]),
            other => panic!("expected MultipleChoice, got {other:?}"),
        }
    }

    #[test]
    fn classifies_open_vs_yes_no_question() {
        assert_eq!(classify("How should I structure the module?"), ResponseType::OpenQuestion);
        assert_eq!(classify("Should I implement caching here?"), ResponseType::YesNoQuestion);
    }

    #[test]
    fn classifies_plain_continuation() {
        assert_eq!(classify("Working on the next file now."), ResponseType::Continuation);
    }

    #[test]
    fn generate_response_is_deterministic_for_same_task_and_iteration() {
        let a = generate_response("Should I proceed?", "task-1", 3);
        let b = generate_response("Should I proceed?", "task-1", 3);
        assert_eq!(a, b);
    }

    #[test]
    fn generate_response_varies_across_iterations() {
        let texts: std::collections::HashSet<String> = (0..20)
            .map(|i| generate_response("Just continuing the implementation.", "task-1", i))
            .collect();
        assert!(texts.len() > 1);
    }

    #[test]
    fn should_continue_stops_on_completion_without_question() {
        assert!(!should_continue("The feature is implemented and all tests pass.", 2, 20));
    }

    #[test]
    fn should_continue_keeps_going_when_question_present() {
        assert!(should_continue("Implementation done, should I also add docs?", 2, 20));
    }

    #[test]
    fn should_continue_stops_at_iteration_cap() {
        assert!(!should_continue("still working", 20, 20));
    }

    #[test]
    fn extract_choices_caps_at_ten() {
        let body: String = (1..=15).map(|i| format!("{i}. option\n")).collect();
        assert_eq!(extract_choices(&body).len(), 10);
    }
}
