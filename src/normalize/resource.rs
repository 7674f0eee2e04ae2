// Content-type keyword → resource type, first match wins.
const CONTENT_TYPE_PRECEDENCE: &[(&str, &str)] = &[
    ("html", "document"),
    ("css", "stylesheet"),
    ("javascript", "script"),
    ("ecmascript", "script"),
    ("script", "script"),
    ("image", "image"),
    ("font", "font"),
    ("woff", "font"),
    ("json", "fetch"),
    ("xml", "xhr"),
    ("video", "media"),
    ("audio", "media"),
];

const EXTENSION_FALLBACK: &[(&str, &str)] = &[
    ("css", "stylesheet"),
    ("js", "script"),
    ("mjs", "script"),
    ("png", "image"),
    ("jpg", "image"),
    ("jpeg", "image"),
    ("gif", "image"),
    ("webp", "image"),
    ("avif", "image"),
    ("svg", "image"),
    ("ico", "image"),
    ("woff", "font"),
    ("woff2", "font"),
    ("ttf", "font"),
    ("eot", "font"),
    ("otf", "font"),
];

const KNOWN_TYPES: &[&str] = &[
    "document",
    "stylesheet",
    "script",
    "image",
    "font",
    "fetch",
    "xhr",
    "media",
    "other",
];

/// Resource type for one request: explicit backend type, then content type,
/// then URL extension, then `other`.
pub fn classify(explicit: Option<&str>, content_type: &str, url: &str) -> String {
    if let Some(t) = explicit.map(|t| t.trim().to_ascii_lowercase()) {
        if KNOWN_TYPES.contains(&t.as_str()) {
            return t;
        }
    }

    let content_type = content_type.to_ascii_lowercase();
    for (keyword, resource_type) in CONTENT_TYPE_PRECEDENCE {
        if content_type.contains(keyword) {
            return resource_type.to_string();
        }
    }

    if let Some(ext) = url_extension(url) {
        for (candidate, resource_type) in EXTENSION_FALLBACK {
            if ext == *candidate {
                return resource_type.to_string();
            }
        }
    }

    "other".to_string()
}

fn url_extension(url: &str) -> Option<String> {
    let path = match url::Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// `host[:port]` of a request URL.
pub fn host_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => match (u.host_str(), u.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            _ => String::new(),
        },
        Err(_) => String::new(),
    }
}

/// Path plus query string.
pub fn path_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => match u.query() {
            Some(q) => format!("{}?{}", u.path(), q),
            None => u.path().to_string(),
        },
        Err(_) => String::new(),
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_precedence() {
        assert_eq!(classify(None, "text/html; charset=utf-8", "https://a/"), "document");
        assert_eq!(classify(None, "text/css", "https://a/x"), "stylesheet");
        assert_eq!(classify(None, "application/javascript", "https://a/x"), "script");
        assert_eq!(classify(None, "image/svg+xml", "https://a/x"), "image");
        assert_eq!(classify(None, "font/woff2", "https://a/x"), "font");
        assert_eq!(classify(None, "application/json", "https://a/x"), "fetch");
        assert_eq!(classify(None, "application/xml", "https://a/x"), "xhr");
        assert_eq!(classify(None, "video/mp4", "https://a/x"), "media");
    }

    #[test]
    fn test_explicit_type_wins() {
        assert_eq!(classify(Some("Script"), "text/html", "https://a/"), "script");
        assert_eq!(classify(Some("Ping"), "text/css", "https://a/"), "stylesheet");
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(classify(None, "", "https://a/app.JS?v=1"), "script");
        assert_eq!(classify(None, "", "https://a/logo.webp"), "image");
        assert_eq!(classify(None, "", "https://a/f.woff2"), "font");
        assert_eq!(classify(None, "", "https://a/data.json"), "other");
        assert_eq!(classify(None, "", "https://a/"), "other");
    }

    #[test]
    fn test_host_and_path() {
        assert_eq!(host_of("https://a.example:8443/x?y=1"), "a.example:8443");
        assert_eq!(path_of("https://a.example/x?y=1"), "/x?y=1");
        assert_eq!(host_of("not a url"), "");
    }
}
