//! Raw-line document model and edit primitives for the SSH config file.

use super::{DEFAULT_SSH_PORT, HostEntry};
use crate::error::{Error, Result};

/// Classification of one raw line, computed lazily and never stored.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LineKind {
    Blank,
    Comment,
    /// Top-level `Host` declaration with its alias patterns.
    HostDecl(Vec<String>),
    /// Top-level `Match` declaration.
    MatchDecl,
    /// Top-level `Include` directive.
    IncludeDecl,
    /// Indented `key value` parameter line.
    Param { key: String, value: String },
    /// Anything else at top level; the validator rejects these.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BlockKind {
    Host,
    Match,
    Include,
}

/// Location of one block within the raw line sequence.
///
/// `comment_start..decl` are the owned leading comments (no blank line
/// between them and the declaration), `decl..end` is the declaration plus
/// its body with trailing blanks excluded.
#[derive(Debug, Clone)]
pub(crate) struct BlockIndex {
    pub kind: BlockKind,
    pub aliases: Vec<String>,
    pub comment_start: usize,
    pub decl: usize,
    pub end: usize,
}

impl BlockIndex {
    /// A block belongs to the global group when it is not a plain per-host
    /// block: `Host *`, `Include` and `Match` all sort before user hosts.
    fn is_global(&self) -> bool {
        match self.kind {
            BlockKind::Host => self.aliases.iter().any(|a| a == "*"),
            BlockKind::Match | BlockKind::Include => true,
        }
    }
}

/// Strips one level of double quotes from a config token.
pub(crate) fn unquote(token: &str) -> &str {
    let token = token.trim();
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

/// Splits a directive line into `(key, rest)`, honoring both whitespace
/// and `key=value` separators. Returns `None` for lines without a key.
pub(crate) fn split_directive(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_end_matches('\r').trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let split_at = trimmed
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(trimmed.len());
    let key = trimmed[..split_at].to_string();
    let rest = trimmed[split_at..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == '=')
        .trim_end()
        .to_string();
    Some((key, rest))
}

pub(crate) fn classify(line: &str) -> LineKind {
    let body = line.trim_end_matches('\r');
    if body.trim().is_empty() {
        return LineKind::Blank;
    }
    if body.trim_start().starts_with('#') {
        return LineKind::Comment;
    }
    let indented = body.starts_with(' ') || body.starts_with('\t');
    let Some((key, rest)) = split_directive(body) else {
        return LineKind::Other;
    };
    if indented {
        return LineKind::Param {
            key,
            value: rest,
        };
    }
    match key.to_ascii_lowercase().as_str() {
        "host" => LineKind::HostDecl(
            rest.split_whitespace()
                .map(|t| unquote(t).to_string())
                .collect(),
        ),
        "match" => LineKind::MatchDecl,
        "include" => LineKind::IncludeDecl,
        _ => LineKind::Other,
    }
}

/// OpenSSH-style pattern match supporting `*` and `?`.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Pattern-list match: at least one positive pattern matches and no
/// negated pattern does.
fn pattern_list_matches(patterns: &[String], name: &str) -> bool {
    let mut positive_hit = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if pattern_matches(negated, name) {
                return false;
            }
        } else if pattern_matches(pattern, name) {
            positive_hit = true;
        }
    }
    positive_hit
}

/// The SSH config document: raw lines plus the parsed overlay.
#[derive(Debug, Clone, Default)]
pub struct SshConfigDoc {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl SshConfigDoc {
    /// Parses a document. Any text is representable; validity is checked
    /// separately by [`super::validator::validate`].
    pub fn parse(text: &str) -> Self {
        if text.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: false,
            };
        }
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let trailing_newline = text.ends_with('\n');
        if trailing_newline {
            lines.pop();
        }
        Self {
            lines,
            trailing_newline,
        }
    }

    /// Serializes back to the exact original bytes when unmodified.
    pub fn serialize(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Computes the block overlay from scratch.
    pub(crate) fn blocks(&self) -> Vec<BlockIndex> {
        let kinds: Vec<LineKind> = self.lines.iter().map(|l| classify(l)).collect();
        let mut decls = Vec::new();
        for (idx, kind) in kinds.iter().enumerate() {
            let block_kind = match kind {
                LineKind::HostDecl(_) => BlockKind::Host,
                LineKind::MatchDecl => BlockKind::Match,
                LineKind::IncludeDecl => BlockKind::Include,
                _ => continue,
            };
            let aliases = match kind {
                LineKind::HostDecl(aliases) => aliases.clone(),
                _ => Vec::new(),
            };
            // Comments directly above with no blank line in between belong
            // to this block.
            let mut comment_start = idx;
            while comment_start > 0 && kinds[comment_start - 1] == LineKind::Comment {
                comment_start -= 1;
            }
            decls.push(BlockIndex {
                kind: block_kind,
                aliases,
                comment_start,
                decl: idx,
                end: idx + 1,
            });
        }

        // A block's body runs until the next block's comment group; trailing
        // blank lines are separators, not body.
        let count = decls.len();
        for i in 0..count {
            let boundary = if i + 1 < count {
                decls[i + 1].comment_start
            } else {
                self.lines.len()
            };
            let mut end = boundary;
            while end > decls[i].decl + 1 && kinds[end - 1] == LineKind::Blank {
                end -= 1;
            }
            decls[i].end = end;
        }
        decls
    }

    fn host_block_exact(&self, alias: &str) -> Option<BlockIndex> {
        self.blocks()
            .into_iter()
            .find(|b| b.kind == BlockKind::Host && b.aliases.iter().any(|a| a == alias))
    }

    /// Resolves an alias: exact match first, then declared wildcard
    /// patterns. Never falls through to `Host *`.
    pub fn get_host(&self, name: &str) -> Result<HostEntry> {
        if let Some(block) = self.host_block_exact(name) {
            return Ok(self.entry_from_block(&block, name));
        }
        for block in self.blocks() {
            if block.kind != BlockKind::Host || block.is_global() {
                continue;
            }
            if pattern_list_matches(&block.aliases, name) {
                return Ok(self.entry_from_block(&block, name));
            }
        }
        Err(Error::HostNotFound(name.to_string()))
    }

    /// All user-managed host entries, in file order. Wildcard-only blocks
    /// (`Host *`) are omitted.
    pub fn hosts(&self) -> Vec<HostEntry> {
        self.blocks()
            .iter()
            .filter(|b| b.kind == BlockKind::Host && !b.is_global())
            .map(|b| {
                let alias = b.aliases.first().cloned().unwrap_or_default();
                self.entry_from_block(b, &alias)
            })
            .collect()
    }

    fn entry_from_block(&self, block: &BlockIndex, alias: &str) -> HostEntry {
        let mut entry = HostEntry::named(alias);
        entry.aliases = block.aliases.clone();
        entry.description = self.lines[block.comment_start..block.decl]
            .iter()
            .map(|l| l.trim_start().trim_start_matches('#').trim().to_string())
            .collect();
        for line in &self.lines[block.decl + 1..block.end] {
            let LineKind::Param { key, value } = classify(line) else {
                continue;
            };
            let value = unquote(&value).to_string();
            match key.to_ascii_lowercase().as_str() {
                "hostname" => entry.host_name = Some(value),
                "user" => entry.user = Some(value),
                "port" => entry.port = value.parse().unwrap_or(DEFAULT_SSH_PORT),
                "identityfile" => entry.identity_file = Some(value),
                _ => entry.params.push((key, value)),
            }
        }
        entry
    }

    /// Sets (or with an empty value removes) a parameter on a host block,
    /// creating the block if it does not exist.
    pub fn set_param(&mut self, host: &str, key: &str, value: &str) {
        let Some(block) = self.host_block_exact(host) else {
            if value.is_empty() {
                return;
            }
            self.append_block(&[
                format!("Host {host}"),
                format!("    {key} {value}"),
            ]);
            return;
        };

        let mut existing = Vec::new();
        for idx in block.decl + 1..block.end {
            if let LineKind::Param { key: line_key, .. } = classify(&self.lines[idx]) {
                if line_key.eq_ignore_ascii_case(key) {
                    existing.push(idx);
                }
            }
        }

        if value.is_empty() {
            for idx in existing.into_iter().rev() {
                self.lines.remove(idx);
            }
            return;
        }

        if let Some(&first) = existing.first() {
            let line = &self.lines[first];
            let indent: String = line
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect();
            let original_key = split_directive(line)
                .map(|(k, _)| k)
                .unwrap_or_else(|| key.to_string());
            self.lines[first] = format!("{indent}{original_key} {value}");
            return;
        }

        let indent = self.lines[block.decl + 1..block.end]
            .iter()
            .find_map(|line| match classify(line) {
                LineKind::Param { .. } => Some(
                    line.chars()
                        .take_while(|c| c.is_whitespace())
                        .collect::<String>(),
                ),
                _ => None,
            })
            .unwrap_or_else(|| "    ".to_string());
        self.lines
            .insert(block.decl + 1, format!("{indent}{key} {value}"));
    }

    /// Appends a new host block built from `entry`. Fails if the alias is
    /// already declared.
    pub fn add_host(&mut self, entry: &HostEntry) -> Result<()> {
        if self.host_block_exact(&entry.alias).is_some() {
            return Err(Error::Validation(format!(
                "host '{}' already exists",
                entry.alias
            )));
        }
        let mut block = Vec::new();
        for comment in &entry.description {
            block.push(format!("# {comment}"));
        }
        block.push(format!("Host {}", entry.alias));
        if let Some(host_name) = &entry.host_name {
            block.push(format!("    HostName {host_name}"));
        }
        if let Some(user) = &entry.user {
            block.push(format!("    User {user}"));
        }
        if entry.port != DEFAULT_SSH_PORT {
            block.push(format!("    Port {}", entry.port));
        }
        if let Some(identity_file) = &entry.identity_file {
            block.push(format!("    IdentityFile {identity_file}"));
        }
        for (key, value) in &entry.params {
            block.push(format!("    {key} {value}"));
        }
        self.append_block(&block);
        Ok(())
    }

    fn append_block(&mut self, block: &[String]) {
        while matches!(self.lines.last(), Some(l) if l.trim().is_empty()) {
            self.lines.pop();
        }
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines.extend_from_slice(block);
        self.trailing_newline = true;
    }

    /// Deletes a host block together with its owned comments and one
    /// adjacent trailing blank line.
    pub fn remove_host(&mut self, alias: &str) -> Result<()> {
        let block = self
            .host_block_exact(alias)
            .ok_or_else(|| Error::HostNotFound(alias.to_string()))?;
        self.lines.drain(block.comment_start..block.end);
        if block.comment_start < self.lines.len()
            && self.lines[block.comment_start].trim().is_empty()
        {
            self.lines.remove(block.comment_start);
        } else if block.comment_start > 0
            && block.comment_start == self.lines.len()
            && self.lines[block.comment_start - 1].trim().is_empty()
        {
            self.lines.remove(block.comment_start - 1);
        }
        Ok(())
    }

    /// Rewrites exactly the matched alias token on a multi-alias `Host`
    /// line; spacing and every other token stay untouched.
    pub fn rename_host(&mut self, old: &str, new: &str) -> Result<()> {
        if self.host_block_exact(new).is_some() {
            return Err(Error::Validation(format!("host '{new}' already exists")));
        }
        let block = self
            .host_block_exact(old)
            .ok_or_else(|| Error::HostNotFound(old.to_string()))?;
        let line = &self.lines[block.decl];
        let mut rebuilt = String::with_capacity(line.len());
        let mut chars = line.char_indices().peekable();
        let mut keyword_seen = false;
        while let Some(&(start, c)) = chars.peek() {
            if c.is_whitespace() {
                rebuilt.push(c);
                chars.next();
                continue;
            }
            let mut end = start;
            while let Some(&(idx, tc)) = chars.peek() {
                if tc.is_whitespace() {
                    break;
                }
                end = idx + tc.len_utf8();
                chars.next();
            }
            let token = &line[start..end];
            if !keyword_seen {
                keyword_seen = true;
                rebuilt.push_str(token);
            } else if unquote(token) == old {
                rebuilt.push_str(new);
            } else {
                rebuilt.push_str(token);
            }
        }
        self.lines[block.decl] = rebuilt;
        Ok(())
    }

    /// Physically reorders host blocks. Global directives (`Host *`,
    /// `Include`, `Match`) are lifted above all per-host blocks; every
    /// block keeps its owned comments. Hosts absent from `order` retain
    /// their original relative position after the listed ones.
    pub fn reorder_hosts(&mut self, order: &[String]) -> Result<()> {
        let blocks = self.blocks();
        if blocks.is_empty() {
            return Ok(());
        }

        let preamble_end = blocks[0].comment_start;
        let mut preamble: Vec<String> = self.lines[..preamble_end].to_vec();
        while matches!(preamble.last(), Some(l) if l.trim().is_empty()) {
            preamble.pop();
        }

        let segment =
            |b: &BlockIndex| -> Vec<String> { self.lines[b.comment_start..b.end].to_vec() };

        let mut globals: Vec<Vec<String>> = Vec::new();
        let mut hosts: Vec<(Vec<String>, Vec<String>)> = Vec::new();
        for block in &blocks {
            if block.is_global() {
                globals.push(segment(block));
            } else {
                hosts.push((block.aliases.clone(), segment(block)));
            }
        }

        let mut ordered: Vec<Vec<String>> = Vec::new();
        let mut taken = vec![false; hosts.len()];
        for wanted in order {
            if let Some(pos) = hosts
                .iter()
                .enumerate()
                .position(|(i, (aliases, _))| !taken[i] && aliases.iter().any(|a| a == wanted))
            {
                taken[pos] = true;
                ordered.push(hosts[pos].1.clone());
            }
        }
        for (i, (_, seg)) in hosts.iter().enumerate() {
            if !taken[i] {
                ordered.push(seg.clone());
            }
        }

        let mut lines = Vec::new();
        if !preamble.is_empty() {
            lines.extend(preamble);
            lines.push(String::new());
        }
        for seg in globals.into_iter().chain(ordered) {
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.extend(seg);
        }
        self.lines = lines;
        self.trailing_newline = true;
        Ok(())
    }
}
