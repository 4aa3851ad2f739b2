use std::io::{BufRead, Write};
use std::sync::Mutex;

use super::{Confirmation, HumanPrompt};
use crate::error::SortError;
use crate::BinColor;

/// Terminal prompt. Reads one answer line per question.
///
/// The reader and writer are injectable so the dialogue can be exercised
/// without a terminal.
pub struct ConsolePrompt {
    io: Mutex<ConsoleIo>,
}

struct ConsoleIo {
    input: Box<dyn BufRead + Send>,
    output: Box<dyn Write + Send>,
}

impl ConsolePrompt {
    pub fn stdio() -> Self {
        Self::new(
            Box::new(std::io::BufReader::new(std::io::stdin())),
            Box::new(std::io::stderr()),
        )
    }

    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            io: Mutex::new(ConsoleIo { input, output }),
        }
    }

    fn with_io<T>(&self, f: impl FnOnce(&mut ConsoleIo) -> std::io::Result<T>) -> Result<T, SortError> {
        let mut io = self
            .io
            .lock()
            .map_err(|_| SortError::InvalidUserInput("console unavailable".to_string()))?;
        f(&mut io).map_err(|e| SortError::InvalidUserInput(format!("console error: {}", e)))
    }
}

impl ConsoleIo {
    fn ask(&mut self, question: &str) -> std::io::Result<Option<String>> {
        write!(self.output, "{}", question)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl HumanPrompt for ConsolePrompt {
    fn ask_bin(&self, class_name: &str) -> Result<Option<BinColor>, SortError> {
        let answer = self.with_io(|io| {
            writeln!(io.output, "\nUnknown object: '{}'", class_name)?;
            writeln!(io.output, "Which bin? (yellow / green / brown, empty to skip)")?;
            io.ask("Bin: ")
        })?;
        match answer {
            None => Ok(None),
            Some(answer) if answer.is_empty() => Ok(None),
            Some(answer) => answer.parse::<BinColor>().map(Some),
        }
    }

    fn confirm_detection(&self, class_name: &str) -> Result<Confirmation, SortError> {
        self.with_io(|io| {
            writeln!(io.output, "\nDetected: '{}'. Is this correct?", class_name)?;
            writeln!(io.output, "  y    - yes, keep the image for training")?;
            writeln!(io.output, "  n    - no, enter the right name")?;
            writeln!(io.output, "  skip - ignore this detection")?;
            let choice = io.ask("Choice: ")?.unwrap_or_default().to_lowercase();
            match choice.as_str() {
                "y" | "yes" => Ok(Confirmation::Accept),
                "n" | "no" => {
                    let name = io.ask("Correct name: ")?.unwrap_or_default();
                    Ok(Confirmation::Correct(name))
                }
                _ => Ok(Confirmation::Skip),
            }
        })
    }
}
