//! Turns links discovered on a page into absolute URLs.

use crate::facts::LinkParser;

/// Resolves references found on a page against that page's URL.
#[derive(Clone, Default)]
pub struct Resolver {
    parser: LinkParser,
}

impl Resolver {
    pub fn new(parser: LinkParser) -> Self {
        Self { parser }
    }

    pub fn parser(&self) -> &LinkParser {
        &self.parser
    }

    /// Scheme and authority of `link`, or an empty string when it has none.
    pub fn homepage(&self, link: &str) -> String {
        self.parser.homepage(link).unwrap_or_default()
    }

    /// Produces the absolute form of `reference` as found on `page_url`.
    ///
    /// `homepage` defaults to the scheme and authority of `page_url`. Never
    /// fails: a malformed page URL yields a best-effort string.
    pub fn resolve(&self, reference: &str, page_url: &str, homepage: Option<&str>) -> String {
        let homepage = match homepage {
            Some(homepage) => homepage.to_string(),
            None => self.homepage(page_url),
        };

        let resolved = self.resolve_shape(reference, page_url, &homepage);
        reanchor(&resolved, &homepage)
    }

    fn resolve_shape(&self, reference: &str, page_url: &str, homepage: &str) -> String {
        if self.parser.parse(reference).is_absolute {
            return reference.to_string();
        }

        if reference.starts_with('#') {
            let page = page_url.split('#').next().unwrap_or_default();
            return format!("{page}{reference}");
        }

        if let Some(rest) = reference.strip_prefix('?') {
            return self.merge_query(rest, page_url);
        }

        if reference.starts_with("//") {
            return format!("{}{reference}", self.scheme_for(page_url, homepage));
        }

        if reference.starts_with("../") {
            let path = self.parser.parse(page_url).path;
            let sep = separator(&path);

            let mut dir = containing_dir(&path, sep);
            let mut rest = reference;
            while let Some(stripped) = rest.strip_prefix("../") {
                dir = parent_dir(&dir, sep);
                rest = stripped;
            }

            let joined = format!("{dir}{rest}");
            return self.resolve_shape(joined.trim_start_matches("../"), homepage, homepage);
        }

        if reference.starts_with('/') {
            return format!("{homepage}{reference}");
        }

        let reference = reference.strip_prefix("./").unwrap_or(reference);
        let facts = self.parser.parse(page_url);
        if facts.no_query.ends_with('/') {
            format!("{}{reference}", facts.no_query)
        } else {
            let parent = facts.path.rfind('/').map_or("", |i| &facts.path[..i]);
            format!("{homepage}{parent}/{reference}")
        }
    }

    fn merge_query(&self, rest: &str, page_url: &str) -> String {
        let facts = self.parser.parse(page_url);
        let mut link = facts.no_query;

        match facts.query.as_deref() {
            Some(query) if !query.is_empty() && !rest.is_empty() => {
                link.push('?');
                link.push_str(query);
                link.push('&');
                link.push_str(rest);
            }
            Some(query) if !query.is_empty() => {
                link.push('?');
                link.push_str(query);
            }
            _ => {
                link.push('?');
                link.push_str(rest);
            }
        }

        // A fragment carried by the reference wins over the page's own.
        if !rest.contains('#') {
            if let Some(fragment) = facts.fragment {
                link.push('#');
                link.push_str(&fragment);
            }
        }

        link
    }

    fn scheme_for(&self, page_url: &str, homepage: &str) -> String {
        if page_url.starts_with("https") {
            "https:".to_string()
        } else if page_url.starts_with("http") {
            "http:".to_string()
        } else {
            match self.parser.parse(homepage).scheme {
                Some(scheme) => format!("{scheme}:"),
                None => "http:".to_string(),
            }
        }
    }
}

/// Anchors `resolved` under `homepage` unless it already carries an
/// authority (`//`) or already sits under `homepage`. Exactly one `/`
/// separates the two halves. Applying it twice equals applying it once.
pub fn reanchor(resolved: &str, homepage: &str) -> String {
    if resolved.contains("//") {
        return resolved.to_string();
    }

    let base = homepage.trim_end_matches('/');
    if resolved == base
        || resolved
            .strip_prefix(base)
            .is_some_and(|tail| tail.starts_with('/'))
    {
        return resolved.to_string();
    }

    format!("{base}/{}", resolved.trim_start_matches('/'))
}

/// Separator used by `path`: forward slash unless only backslashes appear.
fn separator(path: &str) -> char {
    if !path.contains('/') && path.contains('\\') {
        '\\'
    } else {
        '/'
    }
}

/// One level up from `dir`, keeping a trailing separator. Stops at the root.
fn parent_dir(dir: &str, sep: char) -> String {
    let trimmed = dir.strip_suffix(sep).unwrap_or(dir);
    match trimmed.rfind(sep) {
        Some(i) => format!("{}{sep}", &trimmed[..i]),
        None => sep.to_string(),
    }
}

/// Directory holding the document at `path`, with a trailing separator.
fn containing_dir(path: &str, sep: char) -> String {
    if path.ends_with(sep) {
        path.to_string()
    } else {
        parent_dir(path, sep)
    }
}
