use std::{ffi::OsString, path::Path};

use color_eyre::eyre::eyre;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::watch::{self, Receiver};

// Listen to changes to a single file, and send a notification in a watch channel.
//
// The parent directory is watched instead of the file itself, so that editors that replace
// the file on save are still picked up.
pub(crate) fn watch_file<W: Watcher>(file: &Path) -> color_eyre::Result<(W, Receiver<()>)> {
    let file_name: OsString = file
        .file_name()
        .ok_or_else(|| eyre!("{} is not a file path", file.display()))?
        .to_owned();
    let directory = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let (tx, rx) = watch::channel(());
    let mut watcher = W::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()));
                if relevant {
                    tx.send_replace(());
                }
            };
        },
        notify::Config::default().with_follow_symlinks(true),
    )?;
    watcher.watch(&directory, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}
