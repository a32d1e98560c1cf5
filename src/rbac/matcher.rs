// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure RBAC action template matching.
//!
//! A template is either a literal action, compared ignoring case, or an action
//! in which one or more path segments are exactly `*`. Such a segment matches a
//! non-`/` character followed by anything, so a trailing `*` spans the rest of
//! the action. A `*` that shares its segment with other characters is not a
//! wildcard and is compared literally.

use regex::{Regex, RegexBuilder};

/// A pre-compiled action template.
#[derive(Debug, Clone)]
pub enum ActionTemplate {
    Literal(String),
    Pattern(Regex),
}

impl ActionTemplate {
    pub fn new(template: &str) -> Self {
        if !template.split('/').any(|segment| segment == "*") {
            return ActionTemplate::Literal(template.to_string());
        }

        let body = template
            .split('/')
            .map(|segment| {
                if segment == "*" {
                    "[^/].*".to_string()
                } else {
                    regex::escape(segment)
                }
            })
            .collect::<Vec<_>>()
            .join("/");

        match RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .build()
        {
            Ok(regex) => ActionTemplate::Pattern(regex),
            // Escaped segments always compile.
            Err(_) => ActionTemplate::Literal(template.to_string()),
        }
    }

    pub fn matches(&self, action: &str) -> bool {
        match self {
            ActionTemplate::Literal(literal) => literal.eq_ignore_ascii_case(action),
            ActionTemplate::Pattern(regex) => regex.is_match(action),
        }
    }
}

/// Whether `template` grants or denies the concrete `action`.
pub fn action_matches(template: &str, action: &str) -> bool {
    ActionTemplate::new(template).matches(action)
}

/// Whether any of `templates` matches `action`.
pub fn any_matches<S: AsRef<str>>(templates: &[S], action: &str) -> bool {
    templates
        .iter()
        .any(|template| action_matches(template.as_ref(), action))
}
