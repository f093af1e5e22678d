use hashbrown::HashMap;
use lazy_static::lazy_static;

lazy_static! {
    static ref DEFAULT_MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("html", "text/html");
        map.insert("htm", "text/html");
        map.insert("css", "text/css");
        map.insert("json", "application/json");
        map.insert("js", "text/javascript");
        map.insert("png", "image/png");
        map.insert("gif", "image/gif");
        map.insert("jpg", "image/jpeg");
        map.insert("ico", "image/x-icon");
        map.insert("svg", "image/svg+xml");
        map.insert("eot", "application/vnd.ms-fontobject");
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("ttf", "font/ttf");
        map.insert("xml", "text/xml");
        map.insert("pdf", "application/pdf");
        map.insert("zip", "application/zip");
        map.insert("gz", "application/gzip");
        map
    };
}

/// Infer a content type from a file path's extension. Overrides (from
/// settings) win over the built-in table; unknown extensions fall back to
/// text/plain.
pub fn content_type_for(path: &str, overrides: &HashMap<String, String>) -> String {
    let ext = path.rsplit('.').next().unwrap_or("");
    if let Some(mime) = overrides.get(ext) {
        return mime.clone();
    }
    DEFAULT_MIME_TYPES
        .get(ext)
        .copied()
        .unwrap_or("text/plain")
        .to_string()
}
