use std::collections::BTreeMap;
use super::{Command, CommandError, Scan};

fn scan_param(flag: &str) -> Option<&'static str> {
    match flag {
        "-m" | "--min" => Some("min"),
        "-M" | "--max" => Some("max"),
        "-l" | "--letter" => Some("letter"),
        "-o" | "--output" => Some("output"),
        "-j" | "--job" => Some("job"),
        _ => None,
    }
}

/// Parse one line of operator input into a [`Command`].
///
/// The command word is case-insensitive; flags and values are not.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(head) = parts.first() else {
        return Err(CommandError::Empty);
    };
    let word = head.to_uppercase();
    let args = &parts[1..];

    match word.as_str() {
        "START" => parse_switch(&word, args, &["-l", "--load-jobs"])
            .map(|load_jobs| Command::Start { load_jobs }),
        "STOP" | "SHUTDOWN" | "EXIT" | "QUIT" => parse_switch(&word, args, &["-s", "--save-jobs"])
            .map(|save_jobs| Command::Stop { save_jobs }),
        "SCAN" => parse_scan(args).map(Command::Scan),
        "STATUS" => parse_status(args),
        "MAP" => no_arguments(&word, args, Command::ReportSnapshot),
        "EXPORTMAP" => no_arguments(&word, args, Command::ExportSnapshot),
        _ => Err(CommandError::Unknown(head.to_string())),
    }
}

fn no_arguments(word: &str, args: &[&str], command: Command) -> Result<Command, CommandError> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::TooManyArguments(word.to_string()))
    }
}

fn parse_switch(word: &str, args: &[&str], accepted: &[&str]) -> Result<bool, CommandError> {
    match args {
        [] => Ok(false),
        [flag] if accepted.iter().any(|a| a.eq_ignore_ascii_case(flag)) => Ok(true),
        [flag] => Err(CommandError::InvalidArgument {
            command: word.to_string(),
            argument: flag.to_string(),
        }),
        _ => Err(CommandError::TooManyArguments(word.to_string())),
    }
}

fn parse_status(args: &[&str]) -> Result<Command, CommandError> {
    match args {
        [] => Ok(Command::Status { job_name: None }),
        [flag, name] if *flag == "-j" || *flag == "--job" => Ok(Command::Status {
            job_name: Some(name.to_string()),
        }),
        [flag, _] => Err(CommandError::InvalidArgument {
            command: "STATUS".to_string(),
            argument: flag.to_string(),
        }),
        [name] if !name.starts_with('-') => Ok(Command::Status {
            job_name: Some(name.to_string()),
        }),
        [flag] => Err(CommandError::MissingValue(flag.to_string())),
        _ => Err(CommandError::TooManyArguments("STATUS".to_string())),
    }
}

fn parse_scan(args: &[&str]) -> Result<Scan, CommandError> {
    let mut options = BTreeMap::new();
    let mut iter = args.iter();

    while let Some(flag) = iter.next() {
        let param = scan_param(flag).ok_or_else(|| CommandError::InvalidArgument {
            command: "SCAN".to_string(),
            argument: flag.to_string(),
        })?;
        let value = iter
            .next()
            .ok_or_else(|| CommandError::MissingValue(flag.to_string()))?;
        options.insert(param, *value);
    }

    let (Some(min), Some(max), Some(letter), Some(output), Some(job)) = (
        options.get("min"),
        options.get("max"),
        options.get("letter"),
        options.get("output"),
        options.get("job"),
    ) else {
        let provided: Vec<_> = options.keys().copied().collect();
        return Err(CommandError::MissingOptions(provided.join(", ")));
    };

    let min: f64 = min
        .parse()
        .map_err(|_| CommandError::InvalidNumber("min".to_string()))?;
    let max: f64 = max
        .parse()
        .map_err(|_| CommandError::InvalidNumber("max".to_string()))?;

    let mut chars = letter.chars();
    let letter = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => return Err(CommandError::InvalidLetter),
    };

    Scan::new(min, max, letter, *output, *job)
}
