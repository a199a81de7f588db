//! Building a Windows command line from an argument vector.
//!
//! Quoting follows the rules the Microsoft C runtime (and
//! `CommandLineToArgvW`) use to split a command line back into arguments:
//!
//! * arguments are separated by a single space;
//! * an argument containing a space or tab, or an empty argument, is wrapped
//!   in double quotes;
//! * backslashes are literal unless they precede a double quote, in which
//!   case each one is doubled;
//! * an embedded double quote is escaped with a backslash.

use std::borrow::Cow;

/// Joins `args` into a single command line.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for arg in args {
        if !line.is_empty() {
            line.push(' ');
        }
        append_arg(&mut line, arg.as_ref());
    }
    line
}

/// Quotes a single argument, borrowing it when no quoting is needed.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if needs_quotes(arg) || arg.contains('"') {
        let mut quoted = String::with_capacity(arg.len() + 2);
        append_arg(&mut quoted, arg);
        Cow::Owned(quoted)
    } else {
        Cow::Borrowed(arg)
    }
}

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty() || arg.contains([' ', '\t'])
}

fn append_arg(line: &mut String, arg: &str) {
    let quote = needs_quotes(arg);
    if quote {
        line.push('"');
    }

    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                push_backslashes(line, backslashes * 2 + 1);
                line.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(line, backslashes);
                line.push(c);
                backslashes = 0;
            }
        }
    }

    if quote {
        // The closing quote makes trailing backslashes significant.
        push_backslashes(line, backslashes * 2);
        line.push('"');
    } else {
        push_backslashes(line, backslashes);
    }
}

fn push_backslashes(line: &mut String, count: usize) {
    line.extend(std::iter::repeat('\\').take(count));
}
