//! SQL lexer.
//!
//! Produces just enough structure for relation detection and rewriting:
//! words, quoted identifiers, literals, bind parameters and symbols.
//! Comments and whitespace are dropped.

use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
  /// Keyword or bare identifier, as written.
  Word(String),
  /// `"ident"`, `` `ident` `` or `[ident]`, unescaped.
  Quoted(String),
  /// `'text'`, unescaped.
  Str(String),
  /// `X'..'` blob literal, hex digits only.
  Blob(String),
  Number(String),
  /// Bind parameter with its SQLite parameter index (1-based).
  Param { text: String, index: usize },
  Symbol(String),
}

impl Token {
  pub fn is_keyword(&self, keyword: &str) -> bool {
    matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
  }

  pub fn is_symbol(&self, symbol: &str) -> bool {
    matches!(self, Token::Symbol(s) if s == symbol)
  }

  /// Identifier text for words and quoted identifiers.
  pub fn ident(&self) -> Option<&str> {
    match self {
      Token::Word(w) | Token::Quoted(w) => Some(w),
      _ => None,
    }
  }
}

impl fmt::Display for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Token::Word(w) | Token::Number(w) | Token::Symbol(w) => f.write_str(w),
      Token::Param { text, .. } => f.write_str(text),
      Token::Quoted(q) => write!(f, "\"{}\"", q.replace('"', "\"\"")),
      Token::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
      Token::Blob(b) => write!(f, "X'{b}'"),
    }
  }
}

const TWO_CHAR_SYMBOLS: &[&str] =
  &["||", "<=", ">=", "<>", "!=", "==", "<<", ">>", "->"];

/// Tokenize `sql`, numbering bind parameters the way SQLite does: `?NNN`
/// takes index NNN, a named parameter reuses its first index, and every
/// other parameter takes one more than the largest index so far.
pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
  let chars: Vec<char> = sql.chars().collect();
  let len = chars.len();
  let mut tokens = Vec::new();
  let mut named: Vec<(String, usize)> = Vec::new();
  let mut max_index = 0;
  let mut i = 0;

  while i < len {
    let c = chars[i];

    if c.is_whitespace() {
      i += 1;
      continue;
    }

    // Comments
    if c == '-' && chars.get(i + 1) == Some(&'-') {
      while i < len && chars[i] != '\n' {
        i += 1;
      }
      continue;
    }
    if c == '/' && chars.get(i + 1) == Some(&'*') {
      i += 2;
      while i < len && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
        i += 1;
      }
      if i >= len {
        return Err(Error::SqlParse("unterminated block comment".into()));
      }
      i += 2;
      continue;
    }

    // Blob literals
    if (c == 'x' || c == 'X') && chars.get(i + 1) == Some(&'\'') {
      let (text, next) = quoted(&chars, i + 1, '\'')?;
      if !text.chars().all(|h| h.is_ascii_hexdigit()) {
        let message = format!("malformed blob literal X'{text}'");
        return Err(Error::SqlParse(message));
      }
      tokens.push(Token::Blob(text));
      i = next;
      continue;
    }

    // Strings and quoted identifiers
    match c {
      '\'' => {
        let (text, next) = quoted(&chars, i, '\'')?;
        tokens.push(Token::Str(text));
        i = next;
        continue;
      }
      '"' | '`' => {
        let (text, next) = quoted(&chars, i, c)?;
        tokens.push(Token::Quoted(text));
        i = next;
        continue;
      }
      '[' => {
        let start = i + 1;
        let Some(end) = chars[start..].iter().position(|&ch| ch == ']') else {
          return Err(Error::SqlParse("unterminated [identifier]".into()));
        };
        tokens.push(Token::Quoted(chars[start..start + end].iter().collect()));
        i = start + end + 1;
        continue;
      }
      _ => {}
    }

    // Numbers
    if c.is_ascii_digit()
      || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
    {
      let start = i;
      if c == '0' && matches!(chars.get(i + 1), Some('x' | 'X')) {
        i += 2;
        while i < len && chars[i].is_ascii_hexdigit() {
          i += 1;
        }
      } else {
        while i < len && (chars[i].is_ascii_digit() || chars[i] == '.') {
          i += 1;
        }
        if i < len && (chars[i] == 'e' || chars[i] == 'E') {
          i += 1;
          if i < len && (chars[i] == '+' || chars[i] == '-') {
            i += 1;
          }
          while i < len && chars[i].is_ascii_digit() {
            i += 1;
          }
        }
      }
      tokens.push(Token::Number(chars[start..i].iter().collect()));
      continue;
    }

    // Parameters
    if c == '?' {
      let start = i;
      i += 1;
      while i < len && chars[i].is_ascii_digit() {
        i += 1;
      }
      let text: String = chars[start..i].iter().collect();
      let index = if text.len() > 1 {
        text[1..]
          .parse::<usize>()
          .map_err(|_| Error::SqlParse(format!("bad parameter {text}")))?
      } else {
        max_index + 1
      };
      max_index = max_index.max(index);
      tokens.push(Token::Param { text, index });
      continue;
    }
    if matches!(c, ':' | '@' | '$')
      && chars.get(i + 1).is_some_and(|ch| is_ident_char(*ch))
    {
      let start = i;
      i += 1;
      while i < len && is_ident_char(chars[i]) {
        i += 1;
      }
      let text: String = chars[start..i].iter().collect();
      let index = match named.iter().find(|(n, _)| *n == text) {
        Some((_, index)) => *index,
        None => {
          max_index += 1;
          named.push((text.clone(), max_index));
          max_index
        }
      };
      tokens.push(Token::Param { text, index });
      continue;
    }

    // Words
    if c.is_alphabetic() || c == '_' {
      let start = i;
      while i < len && (is_ident_char(chars[i]) || chars[i] == '$') {
        i += 1;
      }
      tokens.push(Token::Word(chars[start..i].iter().collect()));
      continue;
    }

    // Symbols
    if c == '-' && chars[i + 1..].starts_with(&['>', '>']) {
      tokens.push(Token::Symbol("->>".into()));
      i += 3;
      continue;
    }
    if let Some(next) = chars.get(i + 1) {
      let pair: String = [c, *next].iter().collect();
      if TWO_CHAR_SYMBOLS.contains(&pair.as_str()) {
        tokens.push(Token::Symbol(pair));
        i += 2;
        continue;
      }
    }
    if "(),.;*=<>+-/%&|~!".contains(c) {
      tokens.push(Token::Symbol(c.to_string()));
      i += 1;
      continue;
    }

    return Err(Error::SqlParse(format!("unexpected character {c:?}")));
  }

  Ok(tokens)
}

fn is_ident_char(c: char) -> bool { c.is_alphanumeric() || c == '_' }

/// Read a quoted run starting at the opening quote `chars[start]`. A doubled
/// quote inside the run stands for one quote character.
fn quoted(
  chars: &[char],
  start: usize,
  quote: char,
) -> Result<(String, usize)> {
  let mut out = String::new();
  let mut i = start + 1;
  while i < chars.len() {
    if chars[i] == quote {
      if chars.get(i + 1) == Some(&quote) {
        out.push(quote);
        i += 2;
        continue;
      }
      return Ok((out, i + 1));
    }
    out.push(chars[i]);
    i += 1;
  }
  Err(Error::SqlParse(format!("unterminated {quote} literal")))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn words(sql: &str) -> Vec<String> {
    tokenize(sql).unwrap().iter().map(ToString::to_string).collect()
  }

  #[test]
  fn splits_words_symbols_and_literals() {
    assert_eq!(
      words("SELECT a.b, 'it''s' FROM t WHERE x >= 1.5e3 -- trailing"),
      vec![
        "SELECT", "a", ".", "b", ",", "'it''s'", "FROM", "t", "WHERE", "x", ">=",
        "1.5e3"
      ]
    );
  }

  #[test]
  fn quoted_identifiers_are_unescaped() {
    let tokens = tokenize(r#"SELECT "we""ird", [br ack], `tick`"#).unwrap();
    assert_eq!(tokens[1], Token::Quoted("we\"ird".into()));
    assert_eq!(tokens[3], Token::Quoted("br ack".into()));
    assert_eq!(tokens[5], Token::Quoted("tick".into()));
  }

  #[test]
  fn parameters_follow_sqlite_numbering() {
    let tokens = tokenize("? ?5 ? :a @b :a $c").unwrap();
    let indexes: Vec<usize> = tokens
      .iter()
      .filter_map(|t| match t {
        Token::Param { index, .. } => Some(*index),
        _ => None,
      })
      .collect();
    assert_eq!(indexes, vec![1, 5, 6, 7, 8, 7, 9]);
  }

  #[test]
  fn block_comments_are_dropped() {
    assert_eq!(words("SELECT /* hi */ 1"), vec!["SELECT", "1"]);
    assert!(tokenize("SELECT /* open").is_err());
  }

  #[test]
  fn json_arrows_and_blobs() {
    assert_eq!(words("a ->> '$.x' || X'0aFF'"), vec![
      "a", "->>", "'$.x'", "||", "X'0aFF'"
    ]);
  }
}
