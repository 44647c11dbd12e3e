use ahash::AHashMap as Map;

/// HTTPリクエストのヘッダ
/// キーは常に小文字で保持する
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: Map<String, String>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { map: Map::default() }
    }

    /// ヘッダを追加する
    /// 同じキーは後勝ちで上書き
    pub fn insert(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_ascii_lowercase(), value.trim().to_string());
    }

    /// 大文字小文字を区別せずに取得する
    pub fn get(&self, key: &str) -> Option<&str> {
        if key.bytes().any(|b| b.is_ascii_uppercase()) {
            self.map.get(&key.to_ascii_lowercase()).map(String::as_str)
        } else {
            self.map.get(key).map(String::as_str)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// head: content-length を数値で取得する
    /// 負数や数値でないものは無視
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length")?.parse().ok()
    }

    /// head: connection
    pub fn connection(&self) -> Option<&str> {
        self.get("connection")
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v.as_ref());
        }
        headers
    }
}

/// keep-alive を続けるか
/// `connection` がちょうど `keep-alive` のときだけ true (HTTP/1.1 の既定値は採用しない)
pub fn supports_keep_alive(headers: &Headers) -> bool {
    headers
        .connection()
        .map(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
        .unwrap_or(false)
}
