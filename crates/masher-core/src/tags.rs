//! Build-system tag names for a repository.

use masher_state::{RepoKey, RequestType};

/// Tags involved in pushing one release/request pair (`F17` shown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTags {
    /// `f17-updates-candidate`
    pub candidate: String,
    /// `f17-updates-testing`
    pub testing: String,
    /// `f17-updates`
    pub stable: String,
    /// `f17-updates-testing-pending` / `f17-updates-pending`
    pub pending: String,
    /// `f17-override`
    pub override_tag: String,
    request: RequestType,
}

impl ReleaseTags {
    pub fn for_repo(repo: &RepoKey) -> Self {
        let prefix = repo.release_prefix();
        let pending = match repo.request {
            RequestType::Testing => format!("{prefix}-updates-testing-pending"),
            RequestType::Stable => format!("{prefix}-updates-pending"),
        };
        Self {
            candidate: format!("{prefix}-updates-candidate"),
            testing: format!("{prefix}-updates-testing"),
            stable: format!("{prefix}-updates"),
            pending,
            override_tag: format!("{prefix}-override"),
            request: repo.request,
        }
    }

    /// Tag a pushed build moves out of.
    pub fn source(&self) -> &str {
        match self.request {
            RequestType::Testing => &self.candidate,
            RequestType::Stable => &self.testing,
        }
    }

    /// Tag a pushed build moves into.
    pub fn destination(&self) -> &str {
        match self.request {
            RequestType::Testing => &self.testing,
            RequestType::Stable => &self.stable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_tags() {
        let tags = ReleaseTags::for_repo(&RepoKey::new("F17", RequestType::Testing));
        assert_eq!(tags.source(), "f17-updates-candidate");
        assert_eq!(tags.destination(), "f17-updates-testing");
        assert_eq!(tags.pending, "f17-updates-testing-pending");
        assert_eq!(tags.override_tag, "f17-override");
    }

    #[test]
    fn test_stable_tags() {
        let tags = ReleaseTags::for_repo(&RepoKey::new("el6", RequestType::Stable));
        assert_eq!(tags.source(), "el6-updates-testing");
        assert_eq!(tags.destination(), "el6-updates");
        assert_eq!(tags.pending, "el6-updates-pending");
    }
}
