//! Route patterns, rules and the matching algorithm.
//!
//! A pattern is a path template whose placeholders each span one segment:
//!
//! | Placeholder      | Matches                     | Argument type |
//! |------------------|-----------------------------|---------------|
//! | `<name>`         | any non-empty segment       | `String`      |
//! | `<string:name>`  | same as `<name>`            | `String`      |
//! | `<int:name>`     | ASCII digits                | `i64`         |
//! | `<float:name>`   | digits `.` digits           | `f64`         |
//! | `<path:name>`    | the rest of the path        | `String`      |
//!
//! `<path:…>` may only be the last segment.
//!
//! # Which rule wins
//!
//! Every rule is tried against the path. Among those that match:
//!
//! 1. exact matches beat prefix matches (branch routes, `<path:…>`);
//! 2. longer prefixes beat shorter ones;
//! 3. segment by segment, static text beats typed placeholders, which beat
//!    plain string placeholders;
//! 4. remaining ties go to the rule registered first.
//!
//! The first of those whose method set accepts the request method handles
//! it. If some rule matched the path but none accepts the method, the answer
//! is `405`.

use std::cmp::Reverse;

use http::Method;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use crate::arguments::Arguments;
use crate::handler::BoxedHandler;

/// Characters escaped when a value is written into a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ').add(b'"').add(b'#').add(b'%').add(b'/').add(b'<').add(b'>')
    .add(b'?').add(b'`').add(b'{').add(b'}');

// ── Route options ─────────────────────────────────────────────────────────────

/// Options for one route registration.
///
/// ```rust
/// use trellis::Route;
/// use http::Method;
///
/// Route::at("/users/<int:id>").method(Method::GET).name("user");
/// Route::at("/static/").branch();
/// Route::at("/u/<int:id>").name("user").alias();
/// Route::at("/docs/").strict_slashes(false);
/// ```
#[derive(Clone, Debug)]
pub struct Route {
    pub(crate) pattern: String,
    pub(crate) methods: Vec<Method>,
    pub(crate) branch: bool,
    pub(crate) alias: bool,
    pub(crate) strict_slashes: bool,
    pub(crate) name: Option<String>,
    pub(crate) redirect_to: Option<String>,
}

impl Route {
    pub fn at(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_owned(),
            methods: Vec::new(),
            branch: false,
            alias: false,
            strict_slashes: true,
            name: None,
            redirect_to: None,
        }
    }

    /// Accept `method`. A route with no methods accepts every method.
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.extend(methods);
        self
    }

    /// Also match every path below the pattern. The handler finds the
    /// unmatched remainder in [`Request::branch_segments`](crate::Request::branch_segments).
    pub fn branch(mut self) -> Self {
        self.branch = true;
        self
    }

    /// Requests matching this route are redirected to the canonical route of
    /// the same endpoint name.
    pub fn alias(mut self) -> Self {
        self.alias = true;
        self
    }

    /// With strict slashes (the default) a route ending in `/` answers a
    /// request without the slash by redirecting to it. Without, both forms
    /// match directly.
    pub fn strict_slashes(mut self, strict: bool) -> Self {
        self.strict_slashes = strict;
        self
    }

    /// Endpoint name used by [`Request::url_for`](crate::Request::url_for).
    /// Defaults to the pattern itself.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Redirect matching requests to `target`, a pattern whose placeholders
    /// are filled from this route's captures. Register it with
    /// [`Router::redirect`](crate::Router::redirect).
    pub fn redirect_to(mut self, target: &str) -> Self {
        self.redirect_to = Some(target.to_owned());
        self
    }
}

// ── Patterns ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Converter {
    String,
    Int,
    Float,
}

impl Converter {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "string" | "default" => Some(Self::String),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    fn accepts(self, text: &str) -> bool {
        match self {
            Self::String => !text.is_empty() && !text.contains('/'),
            Self::Int => !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()),
            Self::Float => match text.split_once('.') {
                Some((whole, frac)) => {
                    !whole.is_empty()
                        && !frac.is_empty()
                        && whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit())
                }
                None => false,
            },
        }
    }

    /// Converts `text` and stores it in `args`. `false` if it does not fit.
    fn convert(self, name: &str, text: &str, args: &mut Arguments) -> bool {
        if !self.accepts(text) {
            return false;
        }
        match self {
            Self::String => args.insert(name, text.to_owned()),
            Self::Int => match text.parse::<i64>() {
                Ok(v) => args.insert(name, v),
                Err(_) => return false,
            },
            Self::Float => match text.parse::<f64>() {
                Ok(v) => args.insert(name, v),
                Err(_) => return false,
            },
        }
        true
    }

    /// Lower is more specific.
    fn weight(self) -> u8 {
        match self {
            Self::Int | Self::Float => 1,
            Self::String => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Segment {
    Static(String),
    Param { name: String, converter: Converter },
}

/// A compiled path template.
#[derive(Clone, Debug)]
pub(crate) struct Pattern {
    segments: Vec<Segment>,
    trailing_slash: bool,
    /// Name of the closing `<path:…>` placeholder, if any.
    rest: Option<String>,
}

impl Pattern {
    pub(crate) fn parse(pattern: &str) -> Result<Self, String> {
        let body = pattern
            .strip_prefix('/')
            .ok_or_else(|| "patterns must start with `/`".to_owned())?;

        let mut raw: Vec<&str> = body.split('/').collect();
        let trailing_slash = raw.last() == Some(&"");
        if trailing_slash {
            raw.pop();
        }

        let mut segments = Vec::with_capacity(raw.len());
        let mut rest = None;
        let mut names: Vec<&str> = Vec::new();

        for (i, seg) in raw.iter().enumerate() {
            let Some(inner) = seg.strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
                if seg.contains(['<', '>']) {
                    return Err(format!("placeholder in `{seg}` must span the whole segment"));
                }
                segments.push(Segment::Static((*seg).to_owned()));
                continue;
            };

            let (converter, name) = inner.split_once(':').unwrap_or(("", inner));
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(format!("bad placeholder name in `{seg}`"));
            }
            if names.contains(&name) {
                return Err(format!("placeholder `{name}` appears twice"));
            }
            names.push(name);

            if converter == "path" {
                if i + 1 != raw.len() || trailing_slash {
                    return Err(format!("`<path:{name}>` must be the last segment"));
                }
                rest = Some(name.to_owned());
                continue;
            }
            let converter = Converter::from_name(converter)
                .ok_or_else(|| format!("unknown converter `{converter}`"))?;
            segments.push(Segment::Param { name: name.to_owned(), converter });
        }

        Ok(Self { segments, trailing_slash, rest })
    }

    pub(crate) fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param { name, .. } => Some(name.as_str()),
                Segment::Static(_) => None,
            })
            .chain(self.rest.as_deref())
    }

    fn weights(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Static(_) => 0,
                Segment::Param { converter, .. } => converter.weight(),
            })
            .collect()
    }

    /// Matches the fixed segments against the start of `segs`.
    fn match_prefix(&self, segs: &[String], args: &mut Arguments, raw: &mut Vec<(String, String)>) -> bool {
        if segs.len() < self.segments.len() {
            return false;
        }
        self.segments.iter().zip(segs).all(|(pattern, actual)| match pattern {
            Segment::Static(text) => text == actual,
            Segment::Param { name, converter } => {
                raw.push((name.clone(), actual.clone()));
                converter.convert(name, actual, args)
            }
        })
    }

    /// Fills the template from `values`. Returns the path and the names it
    /// used, or `None` if a placeholder is missing or its value does not fit.
    pub(crate) fn build(&self, values: &[(String, String)]) -> Option<(String, Vec<String>)> {
        let lookup = |name: &str| values.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let mut path = String::new();
        let mut used = Vec::new();

        for seg in &self.segments {
            path.push('/');
            match seg {
                Segment::Static(text) => path.push_str(text),
                Segment::Param { name, converter } => {
                    let value = lookup(name)?;
                    if !converter.accepts(value) {
                        return None;
                    }
                    path.extend(utf8_percent_encode(value, SEGMENT));
                    used.push(name.clone());
                }
            }
        }
        if let Some(name) = &self.rest {
            let value = lookup(name).filter(|v| !v.is_empty())?;
            for piece in value.split('/') {
                path.push('/');
                path.extend(utf8_percent_encode(piece, SEGMENT));
            }
            used.push(name.clone());
        }
        if self.trailing_slash || path.is_empty() {
            path.push('/');
        }
        Some((path, used))
    }
}

// ── Rules ─────────────────────────────────────────────────────────────────────

pub(crate) enum Target {
    Handler(BoxedHandler),
    /// Send the client to this pattern, filled with the captured values.
    Redirect(Pattern),
}

/// One registered route.
pub(crate) struct Rule {
    pub(crate) index: usize,
    pub(crate) source: String,
    pub(crate) pattern: Pattern,
    pub(crate) endpoint: String,
    pub(crate) methods: Vec<Method>,
    pub(crate) branch: bool,
    pub(crate) alias: bool,
    pub(crate) strict_slashes: bool,
    pub(crate) target: Target,
}

/// What a rule extracted from the path.
pub(crate) struct Captures {
    pub(crate) args: Arguments,
    /// Decoded placeholder text, for filling redirect targets.
    pub(crate) raw: Vec<(String, String)>,
    /// Segments this rule consumed from the request's remaining path.
    pub(crate) consumed: usize,
    /// Below-prefix segments for branch matches.
    pub(crate) branch: Option<Vec<String>>,
}

enum Hit {
    Path { key: (u8, Reverse<usize>, Vec<u8>, usize), captures: Captures },
    /// Would match with a trailing slash added.
    Slash,
}

impl Rule {
    /// Compiles `route` under the subroute `prefix`.
    pub(crate) fn compile(index: usize, prefix: &str, route: Route, target: Target) -> Result<Self, String> {
        let source = format!("{prefix}{}", route.pattern);
        let pattern = Pattern::parse(&source)?;
        if route.branch && pattern.rest.is_some() {
            return Err("branch routes cannot end in a `<path:…>` placeholder".into());
        }
        Ok(Self {
            index,
            endpoint: route.name.unwrap_or_else(|| source.clone()),
            source,
            pattern,
            methods: route.methods,
            branch: route.branch,
            alias: route.alias,
            strict_slashes: route.strict_slashes,
            target,
        })
    }

    pub(crate) fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self.methods.contains(method)
            || (*method == Method::HEAD && self.methods.contains(&Method::GET))
    }

    pub(crate) fn allowed_methods(&self) -> Vec<Method> {
        let mut methods = self.methods.clone();
        if methods.contains(&Method::GET) && !methods.contains(&Method::HEAD) {
            methods.push(Method::HEAD);
        }
        methods
    }

    /// `raw` is the decoded remaining path, trailing empty segment included.
    fn hit(&self, raw: &[String]) -> Option<Hit> {
        // `/foo/` arrives as ["foo", ""]; compare segment counts without the
        // empty tail and judge the slash separately.
        let trailing = raw.last().is_some_and(String::is_empty);
        let segs = if trailing { &raw[..raw.len() - 1] } else { raw };
        let fixed = self.pattern.segments.len();

        // Exact match. A `<path:..>` placeholder always needs the prefix form.
        if self.pattern.rest.is_none() && segs.len() == fixed {
            let mut args = Arguments::new();
            let mut captured = Vec::new();
            if self.pattern.match_prefix(segs, &mut args, &mut captured) {
                let slash_ok = !self.strict_slashes || trailing == self.pattern.trailing_slash;
                if slash_ok {
                    return Some(Hit::Path {
                        key: (0, Reverse(0), self.pattern.weights(), self.index),
                        captures: Captures { args, raw: captured, consumed: fixed, branch: None },
                    });
                }
                // Only the missing slash is redirected; an extra one is a miss.
                if self.pattern.trailing_slash && !trailing {
                    return Some(Hit::Slash);
                }
                return None;
            }
        }

        if self.branch || self.pattern.rest.is_some() {
            let mut args = Arguments::new();
            let mut captured = Vec::new();
            if !self.pattern.match_prefix(raw, &mut args, &mut captured) {
                return None;
            }
            let below = &raw[fixed..];
            let rest = below.join("/");
            // A prefix match needs something below the prefix; `/static/`
            // itself was the exact case above.
            if rest.is_empty() {
                return None;
            }
            // Prefix matches sort after every exact one, longer prefixes first.
            let key = (1, Reverse(fixed), self.pattern.weights(), self.index);
            let captures = match &self.pattern.rest {
                Some(name) => {
                    args.insert(name.as_str(), rest.clone());
                    captured.push((name.clone(), rest));
                    Captures { args, raw: captured, consumed: raw.len(), branch: None }
                }
                None => Captures { args, raw: captured, consumed: fixed, branch: Some(below.to_vec()) },
            };
            return Some(Hit::Path { key, captures });
        }
        None
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

pub(crate) enum Resolution<'r> {
    Matched { rule: &'r Rule, handler: &'r BoxedHandler, captures: Captures },
    /// Redirect to this router-relative path.
    Redirect(String),
    NotFound,
    MethodNotAllowed(Vec<Method>),
}

/// Resolves `method` + the decoded remaining path against `rules`.
pub(crate) fn resolve<'r>(rules: &'r [Rule], method: &Method, raw: &[String]) -> Resolution<'r> {
    let mut hits = Vec::new();
    let mut slash = Vec::new();
    for rule in rules {
        match rule.hit(raw) {
            Some(Hit::Path { key, captures }) => hits.push((key, rule, captures)),
            Some(Hit::Slash) => slash.push(rule),
            None => {}
        }
    }
    // Most specific first: exact before prefix, then segment weights, then
    // registration order.
    hits.sort_by(|a, b| a.0.cmp(&b.0));

    // The first hit that accepts the method wins. Hits that only differ in
    // method feed the `allow` list of a 405.
    let mut allowed: Vec<Method> = Vec::new();
    let mut path_matched = false;
    for (_, rule, captures) in hits {
        path_matched = true;
        if !rule.allows(method) {
            for m in rule.allowed_methods() {
                if !allowed.contains(&m) {
                    allowed.push(m);
                }
            }
            continue;
        }
        if rule.alias {
            return match canonical_path(rules, rule, &captures.raw) {
                Some(path) => Resolution::Redirect(path),
                None => Resolution::NotFound,
            };
        }
        return match &rule.target {
            Target::Handler(handler) => Resolution::Matched { rule, handler, captures },
            Target::Redirect(target) => match target.build(&captures.raw) {
                Some((path, _)) => Resolution::Redirect(path),
                None => Resolution::NotFound,
            },
        };
    }
    if path_matched {
        return Resolution::MethodNotAllowed(allowed);
    }

    // No path matched as sent, but one would with a trailing slash.
    if slash.iter().any(|rule| rule.allows(method)) {
        let mut path = String::new();
        for seg in raw {
            path.push('/');
            path.extend(utf8_percent_encode(seg, SEGMENT));
        }
        path.push('/');
        return Resolution::Redirect(path);
    }
    Resolution::NotFound
}

/// The path of the first non-alias rule of `alias`'s endpoint.
fn canonical_path(rules: &[Rule], alias: &Rule, values: &[(String, String)]) -> Option<String> {
    rules
        .iter()
        .filter(|r| !r.alias && r.endpoint == alias.endpoint && matches!(r.target, Target::Handler(_)))
        .find_map(|r| r.pattern.build(values).map(|(path, _)| path))
}

/// Picks the rule to build a URL for `endpoint` from: non-alias rules first,
/// then rules using more placeholders, then registration order.
pub(crate) fn build_path(
    rules: &[Rule],
    endpoint: &str,
    values: &[(String, String)],
    method: Option<&Method>,
) -> Option<String> {
    let mut candidates: Vec<&Rule> = rules
        .iter()
        .filter(|r| r.endpoint == endpoint)
        .filter(|r| method.is_none_or(|m| r.allows(m)))
        .collect();
    candidates.sort_by_key(|r| (r.alias, Reverse(r.pattern.param_names().count()), r.index));

    candidates.into_iter().find_map(|rule| {
        let (path, used) = rule.pattern.build(values)?;
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        let mut any = false;
        for (k, v) in values.iter().filter(|(k, _)| !used.contains(k)) {
            query.append_pair(k, v);
            any = true;
        }
        Some(if any { format!("{path}?{}", query.finish()) } else { path })
    })
}
