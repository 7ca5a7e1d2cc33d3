//! LIKE pattern construction for substring search.
//!
//! Both the remote `ilike` filter and the local SQLite `LIKE` use `\` as the
//! escape character, so a user query is escaped once and wrapped in `%`.

/// Escape character used in every generated pattern.
pub const ESCAPE: char = '\\';

/// Escape the LIKE metacharacters (`%`, `_` and the escape itself).
pub fn escape_like(input: &str) -> String {
  let mut out = String::with_capacity(input.len() + 4);
  for c in input.chars() {
    if c == '%' || c == '_' || c == ESCAPE {
      out.push(ESCAPE);
    }
    out.push(c);
  }
  out
}

/// Pattern matching `input` literally anywhere in the column.
pub fn contains_pattern(input: &str) -> String {
  format!("%{}%", escape_like(input.trim()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use rusqlite::Connection;

  fn sqlite_like(text: &str, pattern: &str) -> bool {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .query_row("SELECT ?1 LIKE ?2 ESCAPE '\\'", [text, pattern], |row| {
        row.get(0)
      })
      .unwrap()
  }

  #[test]
  fn test_escapes_metacharacters() {
    assert_eq!(escape_like("50% Off_"), "50\\% Off\\_");
    assert_eq!(escape_like("a\\b"), "a\\\\b");
    assert_eq!(contains_pattern("  rose "), "%rose%");
  }

  #[test]
  fn test_pattern_matches_literal_only() {
    let pattern = contains_pattern("50% Off_");
    assert!(sqlite_like("Summer 50% Off_ Edition", &pattern));
    assert!(sqlite_like("summer 50% off_ edition", &pattern));
    assert!(!sqlite_like("50 percent Off!", &pattern));
    assert!(!sqlite_like("500 Offx", &pattern));
    assert!(!sqlite_like("50X OffY", &pattern));
  }
}
