//! Kernel command-line grammar.
//!
//! Space-separated tokens. Leading `-` tokens are options; the rest is a
//! sequence of actions: `run PROG [ARGS...]` starts a user program and
//! waits for it, `rtkt TEST` runs a kernel-thread test. Unknown options
//! and actions earn a diagnostic and are skipped.

use arrayvec::{ArrayString, ArrayVec};

use crate::param::{CMDLINE_MAX, CMDLINE_TOKENS, NAME_MAX};
use crate::thread::Policy;
use crate::{process, selftest};

#[derive(Debug)]
pub struct BootOptions {
    /// `-q`: keep boot chatter down.
    pub quiet: bool,
    /// `-rs SEED`
    pub random_seed: Option<u64>,
    /// `-ul N`: cap the user pool at N pages.
    pub user_limit: Option<usize>,
    /// `-sched POL`
    pub policy: Policy,
    /// `-f`: format the file system (forwarded to the collaborator).
    pub format: bool,
    /// `-filesys NAME`, `-scratch NAME`, `-swap NAME`: disk role names,
    /// forwarded to the collaborator.
    pub filesys: Option<ArrayString<NAME_MAX>>,
    pub scratch: Option<ArrayString<NAME_MAX>>,
    pub swap: Option<ArrayString<NAME_MAX>>,
}

impl BootOptions {
    pub const fn new() -> Self {
        Self {
            quiet: false,
            random_seed: None,
            user_limit: None,
            policy: Policy::Fifo,
            format: false,
            filesys: None,
            scratch: None,
            swap: None,
        }
    }
}

impl Default for BootOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn name_arg(value: Option<&&str>) -> Option<ArrayString<NAME_MAX>> {
    value.and_then(|v| ArrayString::from(v).ok())
}

/// Split `line`, consume the leading options, and hand back the remaining
/// action tokens.
pub fn parse(line: &str) -> (BootOptions, ArrayVec<&str, CMDLINE_TOKENS>) {
    let mut options = BootOptions::new();
    let mut tokens: ArrayVec<&str, CMDLINE_TOKENS> = ArrayVec::new();
    for tok in line.split_whitespace().take(CMDLINE_TOKENS) {
        tokens.push(tok);
    }

    let mut i = 0;
    while i < tokens.len() && tokens[i].starts_with('-') {
        let opt = tokens[i];
        match opt {
            "-q" => options.quiet = true,
            "-f" => options.format = true,
            "-rs" => {
                options.random_seed = tokens.get(i + 1).and_then(|v| v.parse().ok());
                i += 1;
            }
            "-ul" => {
                options.user_limit = tokens.get(i + 1).and_then(|v| v.parse().ok());
                i += 1;
            }
            "-sched" => {
                match tokens.get(i + 1).and_then(|v| Policy::from_name(v)) {
                    Some(policy) => options.policy = policy,
                    None => println!("unknown scheduler policy (using fifo)"),
                }
                i += 1;
            }
            "-filesys" => {
                options.filesys = name_arg(tokens.get(i + 1));
                i += 1;
            }
            "-scratch" => {
                options.scratch = name_arg(tokens.get(i + 1));
                i += 1;
            }
            "-swap" => {
                options.swap = name_arg(tokens.get(i + 1));
                i += 1;
            }
            _ => println!("unknown option '{}' (skipped)", opt),
        }
        i += 1;
    }

    let mut actions = ArrayVec::new();
    for tok in &tokens[i..] {
        actions.push(*tok);
    }
    (options, actions)
}

/// One decoded action.
#[derive(Debug, PartialEq, Eq)]
pub enum Action<'a> {
    /// `run PROG [ARGS...]` up to the next action keyword.
    Run(&'a [&'a str]),
    /// `rtkt TEST`
    Test(&'a str),
    Unknown(&'a str),
}

fn is_action_keyword(tok: &str) -> bool {
    tok == "run" || tok == "rtkt"
}

/// Decode the action tokens. Pure, so the grammar is testable apart from
/// the side effects of running anything.
pub fn split_actions<'a>(tokens: &'a [&'a str]) -> ArrayVec<Action<'a>, CMDLINE_TOKENS> {
    let mut out = ArrayVec::new();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "run" => {
                let start = i + 1;
                let mut end = start;
                while end < tokens.len() && !is_action_keyword(tokens[end]) {
                    end += 1;
                }
                out.push(Action::Run(&tokens[start..end]));
                i = end;
            }
            "rtkt" => {
                match tokens.get(i + 1) {
                    Some(name) => out.push(Action::Test(name)),
                    None => println!("rtkt: missing test name"),
                }
                i += 2;
            }
            other => {
                out.push(Action::Unknown(other));
                i += 1;
            }
        }
    }
    out
}

/// Execute the action sequence.
pub fn run_actions(tokens: &[&str]) {
    for action in split_actions(tokens) {
        match action {
            Action::Run(argv) => {
                if argv.is_empty() {
                    println!("run: missing program name");
                    continue;
                }
                let mut cmd: ArrayString<CMDLINE_MAX> = ArrayString::new();
                for (i, part) in argv.iter().enumerate() {
                    if i > 0 {
                        let _ = cmd.try_push(' ');
                    }
                    let _ = cmd.try_push_str(part);
                }
                match process::execute(&cmd) {
                    Ok(tid) => {
                        let _ = process::wait(tid);
                    }
                    Err(e) => println!("run: '{}' failed: {}", cmd, e),
                }
            }
            Action::Test(name) => selftest::run(name),
            Action::Unknown(tok) => println!("unknown action '{}' (skipped)", tok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_line_is_quiet() {
        let (options, actions) = parse("-q");
        assert!(options.quiet);
        assert!(actions.is_empty());
    }

    #[test]
    fn options_with_values() {
        let (options, actions) = parse("-rs 1234 -ul 16 -sched prio -filesys hda run echo hi");
        assert_eq!(options.random_seed, Some(1234));
        assert_eq!(options.user_limit, Some(16));
        assert_eq!(options.policy, Policy::Priority);
        assert_eq!(options.filesys.as_deref(), Some("hda"));
        assert_eq!(&actions[..], ["run", "echo", "hi"]);
    }

    #[test]
    fn unknown_option_is_skipped() {
        let (options, actions) = parse("-zap -q run x");
        assert!(options.quiet);
        assert_eq!(&actions[..], ["run", "x"]);
    }

    #[test]
    fn actions_split_on_keywords() {
        let tokens = ["run", "echo", "a", "b", "rtkt", "alarm-single", "run", "ls"];
        let actions = split_actions(&tokens);
        assert_eq!(
            &actions[..],
            [
                Action::Run(&tokens[1..4]),
                Action::Test("alarm-single"),
                Action::Run(&tokens[7..8]),
            ]
        );
    }

    #[test]
    fn unknown_action_is_reported_not_fatal() {
        let tokens = ["frob", "run", "x"];
        let actions = split_actions(&tokens);
        assert_eq!(actions[0], Action::Unknown("frob"));
        assert_eq!(actions[1], Action::Run(&tokens[2..3]));
    }
}
