use std::collections::HashMap;

use thiserror::Error;

/// One dispatchable line of a loaded macro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// 0-based position in the instruction sequence.
    pub index: usize,
    /// 1-based line in the source text, for display.
    pub source_line: usize,
    /// Explicit `N` label, if the line carries one.
    pub label: Option<u32>,
    /// Command text with label, GOTO and comments stripped. May be empty.
    pub text: String,
    /// Label referenced by a `GOTO` on this line.
    pub goto: Option<u32>,
    /// `goto` resolved to a sequence index at load time.
    pub goto_index: Option<usize>,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("duplicate label N{label} on line {line}")]
    DuplicateLabel { label: u32, line: usize },
    #[error("GOTO {target} on line {line} does not match any label")]
    UnresolvedGoto { target: u32, line: usize },
    #[error("malformed GOTO target on line {line}")]
    MalformedGoto { line: usize },
}

/// A parsed macro: ordered instructions plus the label index.
/// Immutable once built; the runner only ever holds indices into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    instructions: Vec<Instruction>,
    labels: HashMap<u32, usize>,
}

impl Program {
    /// Parses macro source. Every `GOTO` target is resolved here so the
    /// runner never encounters a dangling jump; any miss rejects the
    /// whole program.
    pub fn parse(source: &str) -> Result<Program, ParseError> {
        let mut instructions: Vec<Instruction> = Vec::new();
        let mut labels = HashMap::new();

        for (lineno, raw) in source.lines().enumerate() {
            let source_line = lineno + 1;
            let uncommented = match raw.find(';') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let trimmed = uncommented.trim();
            if trimmed.is_empty() || trimmed.starts_with('(') {
                continue;
            }

            let mut tokens: Vec<&str> = trimmed.split_whitespace().collect();

            let mut label = None;
            if let Some(first) = tokens.first() {
                if let Some(value) = parse_label(first) {
                    label = Some(value);
                    tokens.remove(0);
                }
            }

            let index = instructions.len();
            if let Some(value) = label {
                if labels.insert(value, index).is_some() {
                    return Err(ParseError::DuplicateLabel {
                        label: value,
                        line: source_line,
                    });
                }
            }

            let mut goto = None;
            if let Some(pos) = tokens.iter().position(|t| t.eq_ignore_ascii_case("GOTO")) {
                let target = tokens
                    .get(pos + 1)
                    .and_then(|t| t.parse::<u32>().ok())
                    .ok_or(ParseError::MalformedGoto { line: source_line })?;
                goto = Some(target);
                tokens.drain(pos..pos + 2);
            }

            instructions.push(Instruction {
                index,
                source_line,
                label,
                text: tokens.join(" "),
                goto,
                goto_index: None,
            });
        }

        for i in 0..instructions.len() {
            if let Some(target) = instructions[i].goto {
                match labels.get(&target) {
                    Some(&dest) => instructions[i].goto_index = Some(dest),
                    None => {
                        return Err(ParseError::UnresolvedGoto {
                            target,
                            line: instructions[i].source_line,
                        })
                    }
                }
            }
        }

        Ok(Program {
            instructions,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Sequence index of the instruction labelled `N<label>`.
    pub fn resolve(&self, label: u32) -> Option<usize> {
        self.labels.get(&label).copied()
    }
}

/// `N<digits>` only. An `N` token with a non-numeric tail is ordinary
/// command text and stays in the line.
fn parse_label(token: &str) -> Option<u32> {
    let rest = token
        .strip_prefix('N')
        .or_else(|| token.strip_prefix('n'))?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_blank_lines() {
        let program = Program::parse("G28 ; home\n\n; full comment\n(setup block)\nG1 X10\n")
            .unwrap();
        assert_eq!(program.len(), 2);
        assert_eq!(program.get(0).unwrap().text, "G28");
        assert_eq!(program.get(1).unwrap().text, "G1 X10");
    }

    #[test]
    fn labels_and_gotos_are_extracted() {
        let program = Program::parse("N0 G28\nN5 GOTO 15\nN10 G01 X100\nN15 M03\n").unwrap();
        assert_eq!(program.resolve(0), Some(0));
        assert_eq!(program.resolve(15), Some(3));
        let jump = program.get(1).unwrap();
        assert_eq!(jump.label, Some(5));
        assert_eq!(jump.goto, Some(15));
        assert_eq!(jump.goto_index, Some(3));
        assert!(jump.text.is_empty());
    }

    #[test]
    fn label_only_line_is_kept_as_marker() {
        let program = Program::parse("N10\nG1 X1\n").unwrap();
        assert_eq!(program.len(), 2);
        assert!(program.get(0).unwrap().text.is_empty());
        assert_eq!(program.resolve(10), Some(0));
    }

    #[test]
    fn parsing_is_idempotent() {
        let source = "N0 G28\nN5 GOTO 15\nN10 G01 X100 ; rapid\nN15 M03\n";
        let a = Program::parse(source).unwrap();
        let b = Program::parse(source).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let err = Program::parse("N5 G28\nN5 G1 X1\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::DuplicateLabel { label: 5, line: 2 }
        );
    }

    #[test]
    fn unresolved_goto_is_rejected() {
        let err = Program::parse("GOTO 99\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnresolvedGoto {
                target: 99,
                line: 1
            }
        );
    }

    #[test]
    fn malformed_goto_is_rejected() {
        let err = Program::parse("GOTO nowhere\n").unwrap_err();
        assert_eq!(err, ParseError::MalformedGoto { line: 1 });
    }

    #[test]
    fn out_of_order_labels_are_legal() {
        let program = Program::parse("N20 G28\nN10 M03\n").unwrap();
        assert_eq!(program.resolve(20), Some(0));
        assert_eq!(program.resolve(10), Some(1));
    }

    #[test]
    fn non_numeric_n_token_stays_in_text() {
        let program = Program::parse("N10X G1\n").unwrap();
        assert_eq!(program.get(0).unwrap().label, None);
        assert_eq!(program.get(0).unwrap().text, "N10X G1");
    }

    #[test]
    fn goto_is_case_insensitive() {
        let program = Program::parse("N1 M05\ngoto 1\n").unwrap();
        assert_eq!(program.get(1).unwrap().goto_index, Some(0));
    }
}
