use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use vesper_contracts::render::{Notice, NoticeLevel, RenderedMessage, Role};
use vesper_engine::reveal::{reveal_frames, REVEAL_DELAY};
use vesper_engine::{ChatApp, Dispatch, DownloadRequest, UiEvent};

const GENERATING_STATUS: &str = "Generating...";
const PROGRESS_WIDTH: usize = 10;
const CLEAR_LINE: &str = "\r\x1b[2K";

pub fn run_chat(app: &ChatApp, animate: bool) -> Result<()> {
    let opened = app.open_session()?;
    let session_id = opened.session_id.clone();
    println!("{}", opened.title);
    print_notices(&opened.notices);
    match opened.image_model.as_deref() {
        Some(image_model) => println!(
            "Text model {}, image model {image_model}. Type /help for commands.",
            opened.text_model
        ),
        None => println!("Text model {}. Type /help for commands.", opened.text_model),
    }

    let stdin = io::stdin();
    let mut line = String::new();
    let mut shown = 0usize;

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        if input.trim().is_empty() {
            continue;
        }

        let Some(dispatch) = submit_line(app, &session_id, input, animate)? else {
            continue;
        };
        let messages = &dispatch.render.messages;
        if messages.len() < shown {
            println!("History cleared.");
            shown = 0;
        }
        for message in &messages[shown..] {
            // The user's own line is already on screen.
            if message.role == Role::Assistant {
                print_assistant(message, animate)?;
            }
        }
        shown = messages.len();
        print_notices(&dispatch.render.notices);

        if let Some(download) = dispatch.download.as_ref() {
            if let Err(err) = save_download(app, &session_id, download) {
                println!("Download failed: {err:#}");
            }
        }
        if dispatch.quit {
            break;
        }
    }

    app.destroy_session(&session_id)?;
    Ok(())
}

/// Runs one line. A failed dispatch is shown as an error notice and the
/// chat loop carries on.
fn submit_line(
    app: &ChatApp,
    session_id: &str,
    input: &str,
    animate: bool,
) -> Result<Option<Dispatch>> {
    if animate {
        print!("{GENERATING_STATUS}");
        io::stdout().flush()?;
    }
    let dispatched = app.dispatch(session_id, UiEvent::SubmitText(input.to_string()));
    if animate {
        print!("{CLEAR_LINE}");
    }
    match dispatched {
        Ok(dispatch) => Ok(Some(dispatch)),
        Err(err) => {
            print_notices(&[Notice::error(format!("Error: {err:#}"))]);
            Ok(None)
        }
    }
}

fn progress_bar(progress: f32) -> String {
    let filled = (progress.clamp(0.0, 1.0) * PROGRESS_WIDTH as f32).round() as usize;
    format!(
        "[{}{}]",
        "#".repeat(filled),
        " ".repeat(PROGRESS_WIDTH.saturating_sub(filled))
    )
}

fn print_assistant(message: &RenderedMessage, animate: bool) -> Result<()> {
    let label = "assistant: ";
    if animate && !message.content.contains('\n') {
        let mut stdout = io::stdout();
        for frame in reveal_frames(&message.content) {
            if frame.done {
                write!(stdout, "{CLEAR_LINE}{label}{}", frame.text)?;
            } else {
                write!(
                    stdout,
                    "{CLEAR_LINE}{} {label}{}",
                    progress_bar(frame.progress),
                    frame.text
                )?;
            }
            stdout.flush()?;
            if !frame.done {
                thread::sleep(REVEAL_DELAY);
            }
        }
        writeln!(stdout)?;
    } else {
        println!("{label}{}", message.content);
    }

    if let Some(image) = message.image.as_ref() {
        println!(
            "  [image {} {}x{}, {}] /adjust {} ... | /reset {} | /download {}",
            image.key,
            image.width,
            image.height,
            image.settings.describe(),
            image.key,
            image.key,
            image.key
        );
    }
    Ok(())
}

fn print_notices(notices: &[Notice]) {
    for notice in notices {
        println!("{}", format_notice(notice));
    }
}

fn format_notice(notice: &Notice) -> String {
    let tag = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Warning => "warning",
        NoticeLevel::Error => "error",
    };
    format!("[{tag}] {}", notice.text)
}

/// Where a download lands: the requested path, a file inside it when it names
/// a directory, or the default file name in the working directory.
fn download_target(requested: Option<&str>, file_name: &str) -> PathBuf {
    match requested.map(str::trim).filter(|path| !path.is_empty()) {
        Some(path) => {
            let path = PathBuf::from(path);
            if path.is_dir() || path.as_os_str().to_string_lossy().ends_with('/') {
                path.join(file_name)
            } else {
                path
            }
        }
        None => PathBuf::from(file_name),
    }
}

fn save_download(app: &ChatApp, session_id: &str, download: &DownloadRequest) -> Result<()> {
    let export = app.export_png(session_id, &download.key)?;
    for warning in &export.warnings {
        println!("[warning] {warning}");
    }
    let target = download_target(download.path.as_deref(), &export.file_name);
    write_file(&target, &export.bytes)?;
    println!("Saved {}", target.display());
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
