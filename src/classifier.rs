use crate::types::{TaskCategory, TaskInfo};

/// File count beyond which the parallelism hint is set.
const PARALLEL_FILE_THRESHOLD: usize = 3;
/// File count beyond which the task is forced into codebase analysis
/// regardless of keyword matches.
const CODEBASE_ANALYSIS_FILE_THRESHOLD: usize = 10;

/// One keyword rule, examined in order — the first match wins ties.
struct Rule {
    category: TaskCategory,
    keywords: &'static [&'static str],
    recommended: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        category: TaskCategory::BugSearch,
        keywords: &["bug", "fix", "broken", "crash", "error", "not working", "fails"],
        recommended: &["gemini", "qwen", "ollama_local"],
    },
    Rule {
        category: TaskCategory::CodeReview,
        keywords: &["review", "critique", "feedback on", "is this good"],
        recommended: &["gemini", "qwen"],
    },
    Rule {
        category: TaskCategory::Refactor,
        keywords: &["refactor", "clean up", "restructure", "simplify"],
        recommended: &["gemini", "qwen", "ollama_local"],
    },
    Rule {
        category: TaskCategory::Documentation,
        keywords: &["document", "docstring", "write docs", "explain this"],
        recommended: &["qwen", "ollama_local"],
    },
    Rule {
        category: TaskCategory::CodebaseAnalysis,
        keywords: &["explain architecture", "how does this codebase", "analyze the project"],
        recommended: &["gemini", "qwen"],
    },
    Rule {
        category: TaskCategory::CodeGeneration,
        keywords: &["write a", "generate", "implement", "create a function", "add a feature"],
        recommended: &["gemini", "qwen", "ollama_local"],
    },
    Rule {
        category: TaskCategory::QuickQuery,
        keywords: &["what is", "quick question", "briefly"],
        recommended: &["ollama_local", "qwen"],
    },
];

const GENERAL_RECOMMENDED: &[&str] = &["qwen", "ollama_local", "gemini"];

/// Recommended service list for a category, falling back to the
/// general list for categories with no dedicated rule.
pub fn recommended_for(category: TaskCategory) -> Vec<String> {
    RULES
        .iter()
        .find(|rule| rule.category == category)
        .map(|rule| rule.recommended)
        .unwrap_or(GENERAL_RECOMMENDED)
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Parses a `task_type` preference override into a `TaskCategory`.
/// Accepts the category's own `as_str()` form (e.g. `"bug_search"`)
/// case-insensitively; unrecognized strings return `None`.
pub fn parse_category(raw: &str) -> Option<TaskCategory> {
    let lower = raw.to_lowercase();
    match lower.as_str() {
        "code_generation" => Some(TaskCategory::CodeGeneration),
        "code_review" => Some(TaskCategory::CodeReview),
        "bug_search" => Some(TaskCategory::BugSearch),
        "refactor" => Some(TaskCategory::Refactor),
        "documentation" => Some(TaskCategory::Documentation),
        "codebase_analysis" => Some(TaskCategory::CodebaseAnalysis),
        "quick_query" => Some(TaskCategory::QuickQuery),
        "general" => Some(TaskCategory::General),
        _ => None,
    }
}

/// Deterministic, pure rule table lookup — no ML, no I/O. Calling
/// twice with the same arguments always returns an equal `TaskInfo`.
pub fn classify(prompt: &str, files: &[String]) -> TaskInfo {
    let lower = prompt.to_lowercase();
    let file_count = files.len();
    let total_bytes = files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    let mut category = RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|kw| lower.contains(kw)))
        .map(|rule| rule.category)
        .unwrap_or(TaskCategory::General);

    if file_count > CODEBASE_ANALYSIS_FILE_THRESHOLD {
        category = TaskCategory::CodebaseAnalysis;
    }

    let recommended_services = recommended_for(category);

    TaskInfo {
        category,
        file_count,
        total_bytes,
        use_parallel: file_count > PARALLEL_FILE_THRESHOLD,
        recommended_services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_deterministic() {
        let files = vec!["a.rs".to_string(), "b.rs".to_string()];
        let a = classify("please fix this bug in the parser", &files);
        let b = classify("please fix this bug in the parser", &files);
        assert_eq!(a.category, b.category);
        assert_eq!(a.use_parallel, b.use_parallel);
        assert_eq!(a.recommended_services, b.recommended_services);
    }

    #[test]
    fn keyword_selects_bug_search() {
        let info = classify("there's a crash when I click submit", &[]);
        assert_eq!(info.category, TaskCategory::BugSearch);
    }

    #[test]
    fn no_keyword_match_falls_back_to_general() {
        let info = classify("hello there", &[]);
        assert_eq!(info.category, TaskCategory::General);
        assert_eq!(info.recommended_services, GENERAL_RECOMMENDED);
    }

    #[test]
    fn file_count_sets_parallel_hint() {
        let files: Vec<String> = (0..5).map(|i| format!("f{}.rs", i)).collect();
        let info = classify("write a new module", &files);
        assert!(info.use_parallel);
    }

    #[test]
    fn large_file_count_forces_codebase_analysis() {
        let files: Vec<String> = (0..12).map(|i| format!("f{}.rs", i)).collect();
        let info = classify("fix this bug", &files);
        assert_eq!(info.category, TaskCategory::CodebaseAnalysis);
    }

    #[test]
    fn first_matching_rule_wins_ties() {
        let info = classify("please review and refactor this function", &[]);
        assert_eq!(info.category, TaskCategory::CodeReview);
    }

    #[test]
    fn parse_category_roundtrips_as_str() {
        assert_eq!(parse_category("bug_search"), Some(TaskCategory::BugSearch));
        assert_eq!(parse_category("BUG_SEARCH"), Some(TaskCategory::BugSearch));
        assert_eq!(parse_category("not_a_category"), None);
    }
}
