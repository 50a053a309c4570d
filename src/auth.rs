use anyhow::{Result, anyhow};

pub(crate) const MIN_PASSPHRASE_LEN: usize = 6;

/// Check the `supplied` passphrase against the `configured` one.
pub(crate) fn authenticate(configured: Option<&str>, supplied: Option<&str>) -> Result<()> {
    let Some(configured) = configured.filter(|passphrase| !passphrase.is_empty()) else {
        return Err(anyhow!(
            "no passphrase configured, set `passphrase` in preinstall.toml first"
        ));
    };

    if configured.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(anyhow!(
            "the configured passphrase must be at least {MIN_PASSPHRASE_LEN} characters long"
        ));
    }

    let Some(supplied) = supplied else {
        return Err(anyhow!(
            "passphrase required, pass --passphrase or set PREINSTALL_PASSPHRASE"
        ));
    };

    if supplied.trim() != configured {
        return Err(anyhow!("incorrect passphrase"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_passphrase() -> Result<()> {
        authenticate(Some("s3cret!"), Some("s3cret!"))?;
        authenticate(Some("s3cret!"), Some(" s3cret!\n"))
    }

    #[test]
    fn rejected_passphrases() {
        assert!(authenticate(None, Some("s3cret!")).is_err());
        assert!(authenticate(Some(""), Some("")).is_err());
        assert!(authenticate(Some("short"), Some("short")).is_err());
        assert!(authenticate(Some("s3cret!"), None).is_err());
        assert!(authenticate(Some("s3cret!"), Some("S3CRET!")).is_err());
    }
}
