use std::io::{self, BufRead, Write};

use crossbeam::channel::Sender;

use crate::orchestrator::Control;

/// Reads operator commands from stdin until quit or end of input.
///
/// Enter (or `t`) presses the trigger, `a` aborts the running test, `q`
/// shuts the rig down. Returns when the orchestrator stops listening.
pub fn run_trigger_terminal(controls: Sender<Control>) {
    println!("Enter/t: start test | a: abort | q: quit");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        if let Err(e) = io::stdout().flush() {
            eprintln!("Failed to flush stdout: {e}");
            break;
        }

        let control = match lines.next() {
            Some(Ok(line)) => match parse_command(&line) {
                Some(control) => control,
                None => {
                    println!("Unknown command");
                    continue;
                }
            },
            Some(Err(e)) => {
                eprintln!("Failed to read input: {e}");
                Control::Shutdown
            }
            None => Control::Shutdown,
        };

        let quit = control == Control::Shutdown;
        if controls.send(control).is_err() || quit {
            break;
        }
    }
}

fn parse_command(line: &str) -> Option<Control> {
    match line.trim() {
        "" | "t" => Some(Control::Trigger),
        "a" => Some(Control::Abort),
        "q" => Some(Control::Shutdown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(""), Some(Control::Trigger));
        assert_eq!(parse_command(" t "), Some(Control::Trigger));
        assert_eq!(parse_command("a"), Some(Control::Abort));
        assert_eq!(parse_command("q"), Some(Control::Shutdown));
        assert_eq!(parse_command("x"), None);
    }
}
