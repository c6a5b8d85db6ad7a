use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mailbox::{Engine, OpenOptions};
use crate::observable::Observable;
use crate::url::{MailboxUrl, Scheme};

/// On-disk layouts the registrar can instantiate. A closed set: adding a
/// backend means adding a variant here and an arm below.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MailboxFormat {
    Mbox,
    Maildir,
    Dotmail,
}

/// Decide what layout a filesystem path holds.
///
/// A directory with the maildir trio wins; otherwise the file is probed
/// as mbox (level 0 accepts any existing file, level 1 and up demand a
/// valid From_ line in the first 128 bytes), then as dotmail.
pub async fn detect_format(path: &Path, level: u8) -> Result<Option<MailboxFormat>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if meta.is_dir() {
        let maildir = ["cur", "new", "tmp"];
        let mut hits = 0;
        for sub in maildir {
            if tokio::fs::metadata(path.join(sub))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                hits += 1;
            }
        }
        if hits > 0 {
            return Ok(Some(MailboxFormat::Maildir));
        }
        return Ok(None);
    }

    if crate::mbox::looks_like_mbox(path, level).await? {
        return Ok(Some(MailboxFormat::Mbox));
    }
    if crate::dotmail::looks_like_dotmail(path).await? {
        return Ok(Some(MailboxFormat::Dotmail));
    }
    Ok(None)
}

/// Scheme-to-engine dispatch, with autodetection on `file:`.
pub(crate) async fn open_engine(
    url: &MailboxUrl,
    opts: &OpenOptions,
    observable: Arc<Observable>,
) -> Result<Engine> {
    let format = match &url.scheme {
        Scheme::Mbox => MailboxFormat::Mbox,
        Scheme::Maildir => MailboxFormat::Maildir,
        Scheme::Dotmail => MailboxFormat::Dotmail,
        Scheme::File => match detect_format(&url.path, opts.detect_level).await? {
            Some(format) => format,
            None if opts.create => MailboxFormat::Mbox,
            None => {
                return Err(Error::NoSuchScheme(format!(
                    "cannot detect mailbox format of {}",
                    url.path.display()
                )))
            }
        },
        Scheme::Mh => {
            return Err(Error::NoSuchScheme("mh".to_string()));
        }
        Scheme::Other(name) => {
            return Err(Error::NoSuchScheme(name.clone()));
        }
    };

    Ok(match format {
        MailboxFormat::Mbox => Engine::Mbox(
            crate::mbox::MboxMailbox::open(&url.path, opts, observable).await?,
        ),
        MailboxFormat::Maildir => Engine::Maildir(
            crate::maildir::MaildirMailbox::open(&url.path, opts, observable).await?,
        ),
        MailboxFormat::Dotmail => Engine::Dotmail(
            crate::dotmail::DotmailMailbox::open(&url.path, opts, observable).await?,
        ),
    })
}
