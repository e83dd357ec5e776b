//! 输入归一化：去首尾空白、小写、去重音、合并空白
//!
//! 用于选项键、快捷键和关键词匹配；存储到上下文的始终是原始（仅 trim）文本。

/// 归一化用户输入
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars().flat_map(char::to_lowercase) {
            out.push(fold_accent(ch));
        }
    }
    out
}

/// 常见拉丁重音字符映射到基本字母（ñ 保留，西语中是独立字母）
fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        other => other,
    }
}

/// 关键字是否以整词（或词组）形式出现在已归一化文本中
pub fn contains_term(normalized: &str, term: &str) -> bool {
    let term = normalize(term);
    if term.is_empty() {
        return false;
    }
    let padded = format!(" {} ", strip_punctuation(normalized));
    padded.contains(&format!(" {} ", strip_punctuation(&term)))
}

/// 标点替换为空格后重新合并空白
fn strip_punctuation(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_accents_and_whitespace() {
        assert_eq!(normalize("  Buenos   DÍAS\t"), "buenos dias");
        assert_eq!(normalize("Atrás"), "atras");
        assert_eq!(normalize("Menú"), "menu");
        assert_eq!(normalize("Señora"), "señora");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_contains_term_matches_whole_words() {
        let text = normalize("Tengo quemazón y hormigueo en el pie");
        assert!(contains_term(&text, "quemazón"));
        assert!(contains_term(&text, "hormigueo"));
        assert!(!contains_term(&text, "pie izquierdo"));
        assert!(!contains_term(&normalize("holanda"), "hola"));
        assert!(contains_term(&normalize("hola, qué tal"), "que tal"));
        assert!(contains_term(&normalize("¡Hola!"), "hola"));
    }
}
