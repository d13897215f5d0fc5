use crate::rag::{ModelBackend, QaHandler};
use anyhow::Result;
use log::info;
use std::io::{self, BufRead, Write};
use std::path::Path;

const HELP: &str = "Commands:
  /upload <path>   load a PDF, TXT or DOCX document
  /models          list the models available on the server
  /model <name>    switch to another model
  /refresh         reload the model list from the server
  /help            show this help
  exit             quit
Anything else is sent to the assistant.";

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Empty,
    Exit,
    Help,
    Upload(&'a str),
    Models,
    Model(&'a str),
    Refresh,
    Message(&'a str),
    /// A slash command missing its argument or not recognised
    Invalid(&'a str),
}

pub fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        return Command::Exit;
    }
    if !line.starts_with('/') {
        return Command::Message(line);
    }

    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };

    match (name, arg) {
        ("/help", _) => Command::Help,
        ("/models", _) => Command::Models,
        ("/refresh", _) => Command::Refresh,
        ("/upload", path) if !path.is_empty() => Command::Upload(path),
        ("/model", model) if !model.is_empty() => Command::Model(model),
        _ => Command::Invalid(line),
    }
}

/// Index a document and report the outcome; returns whether it succeeded
pub async fn upload<M: ModelBackend>(handler: &mut QaHandler<M>, path: &Path) -> bool {
    println!("Processing document {}...", path.display());
    match handler.try_process_document(path).await {
        Ok(content) => {
            println!(
                "Document processed successfully! It contains {} words.",
                content.split_whitespace().count()
            );
            true
        }
        Err(e) => {
            eprintln!("Error processing document: {:#}", e);
            false
        }
    }
}

pub fn print_models<M: ModelBackend>(handler: &QaHandler<M>) {
    for model in handler.available_models() {
        let marker = if model == handler.current_model() { "*" } else { " " };
        println!("{} {}", marker, model);
    }
}

/// Read user input until `exit` or end of input
pub async fn run_query_loop<M: ModelBackend>(handler: &mut QaHandler<M>) -> Result<()> {
    println!(
        "Chatting with {}. Type /help for commands or 'exit' to quit.",
        handler.current_model()
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYou: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.lock().read_line(&mut buffer)? == 0 {
            break;
        }

        match parse_command(&buffer) {
            Command::Empty => continue,
            Command::Exit => break,
            Command::Help => println!("{}", HELP),
            Command::Upload(path) => {
                upload(handler, Path::new(path)).await;
            }
            Command::Models => print_models(handler),
            Command::Model(model) => {
                if handler.set_model(model) {
                    println!("Model changed to {}", model);
                } else {
                    eprintln!("Failed to switch to model {}", model);
                }
            }
            Command::Refresh => {
                handler.refresh_models().await;
                print_models(handler);
            }
            Command::Message(message) => {
                let response = handler.get_response(message).await;
                println!("\nAssistant: {}", response);
            }
            Command::Invalid(line) => eprintln!("Unknown command: {} (try /help)", line),
        }
    }

    info!("Goodbye!");
    Ok(())
}
