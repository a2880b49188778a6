//! Request classification.
//!
//! The router owns an ordered rule table; the first rule whose predicate
//! matches decides the class. Classification is pure.

use crate::config::RoutesConfig;
use crate::http::Request;

/// What the engine does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Non-GET API call; passed through and never cached
  ApiMutating,
  /// API read on the allow-list; network-first with write-through
  ApiCacheable,
  /// Other API read; network-first with cache fallback, no write-through
  ApiUncached,
  /// Top-level page load; network-first with offline document fallback
  Navigation,
  /// Everything else; cache-first
  StaticAsset,
  /// Not intercepted at all
  Ignored,
}

/// Conditions a rule can test. All present conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
  /// Scheme is anything other than http/https
  pub non_network_scheme: bool,
  pub path_prefix: Option<String>,
  /// Path must contain at least one of these
  pub path_contains_any: Vec<String>,
  /// Some(true) matches GET only, Some(false) non-GET only
  pub get: Option<bool>,
  pub navigate: Option<bool>,
}

impl Matcher {
  fn matches(&self, request: &Request) -> bool {
    let scheme = request.url.scheme();
    let path = request.url.path();

    if self.non_network_scheme && matches!(scheme, "http" | "https") {
      return false;
    }
    if let Some(prefix) = &self.path_prefix {
      if !path.starts_with(prefix.as_str()) {
        return false;
      }
    }
    if !self.path_contains_any.is_empty()
      && !self
        .path_contains_any
        .iter()
        .any(|pattern| path.contains(pattern.as_str()))
    {
      return false;
    }
    if let Some(get) = self.get {
      if request.is_get() != get {
        return false;
      }
    }
    if let Some(navigate) = self.navigate {
      if request.navigate != navigate {
        return false;
      }
    }
    true
  }
}

#[derive(Debug, Clone)]
pub struct Rule {
  pub matcher: Matcher,
  pub class: RequestClass,
}

#[derive(Debug, Clone)]
pub struct Router {
  rules: Vec<Rule>,
}

impl Router {
  pub fn new(rules: Vec<Rule>) -> Self {
    Self { rules }
  }

  /// Build the standard rule table from route config.
  pub fn from_config(config: &RoutesConfig) -> Self {
    let api = || Matcher {
      path_prefix: Some(config.api_prefix.clone()),
      ..Matcher::default()
    };

    Self::new(vec![
      Rule {
        matcher: Matcher {
          non_network_scheme: true,
          ..Matcher::default()
        },
        class: RequestClass::Ignored,
      },
      Rule {
        matcher: Matcher {
          get: Some(false),
          ..api()
        },
        class: RequestClass::ApiMutating,
      },
      Rule {
        matcher: Matcher {
          get: Some(true),
          path_contains_any: config.cache_patterns.clone(),
          ..api()
        },
        class: RequestClass::ApiCacheable,
      },
      Rule {
        matcher: api(),
        class: RequestClass::ApiUncached,
      },
      Rule {
        matcher: Matcher {
          get: Some(false),
          ..Matcher::default()
        },
        class: RequestClass::Ignored,
      },
      Rule {
        matcher: Matcher {
          navigate: Some(true),
          ..Matcher::default()
        },
        class: RequestClass::Navigation,
      },
      Rule {
        matcher: Matcher::default(),
        class: RequestClass::StaticAsset,
      },
    ])
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(request))
      .map(|rule| rule.class)
      .unwrap_or(RequestClass::Ignored)
  }
}
