//! Resource pattern matching.
//!
//! Mutations declare the resources they touch as patterns; queries and relay
//! subscriptions hold concrete tags. A pattern covers a tag when:
//!
//! - it contains no `*` and equals the tag, or
//! - every `*` can be replaced by a run of characters without `/`, and every
//!   `**` by any run of characters, so that the result equals the tag.
//!
//! Matching is case-sensitive and anchored at both ends. The direction is
//! always pattern → tag; a wildcard inside the tag has no special meaning.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    /// `*`: any run without `/`.
    Star,
    /// `**`: any run, including `/`.
    Globstar,
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                tokens.push(Token::Globstar);
            } else {
                tokens.push(Token::Star);
            }
        } else {
            tokens.push(Token::Literal(c));
        }
    }
    tokens
}

/// Does `pattern` cover the concrete resource `tag`?
pub fn matches(pattern: &str, tag: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == tag;
    }

    let tokens = tokenize(pattern);
    let chars: Vec<char> = tag.chars().collect();
    let (n, m) = (tokens.len(), chars.len());

    // table[i * (m + 1) + j]: tokens[i..] matches chars[j..]
    let width = m + 1;
    let mut table = vec![false; (n + 1) * width];
    table[n * width + m] = true;

    for i in (0..n).rev() {
        for j in (0..=m).rev() {
            let rest = |ti: usize, cj: usize| table[ti * width + cj];
            let matched = match tokens[i] {
                Token::Literal(c) => j < m && chars[j] == c && rest(i + 1, j + 1),
                Token::Star => rest(i + 1, j) || (j < m && chars[j] != '/' && rest(i, j + 1)),
                Token::Globstar => rest(i + 1, j) || (j < m && rest(i, j + 1)),
            };
            table[i * width + j] = matched;
        }
    }

    table[0]
}

/// True iff any mutated pattern covers any subscribed tag.
///
/// O(patterns × tags). A single mutation and a single relay dispatch touch a
/// handful of tags, which keeps this cheap in practice.
pub fn was_affected<P, T>(patterns: &[P], tags: &[T]) -> bool
where
    P: AsRef<str>,
    T: AsRef<str>,
{
    patterns
        .iter()
        .any(|p| tags.iter().any(|t| matches(p.as_ref(), t.as_ref())))
}
