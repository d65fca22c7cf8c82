//! Bilingual corpora stored as one plain-text file per language.
//!
//! A corpus named `europarl` with languages `en` and `it` living in `data/` is the pair of
//! files `data/europarl.en` and `data/europarl.it`, aligned line by line.  Readers and writers
//! stream pairs so no corpus is ever held in memory.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;
use walkdir::WalkDir;

use crate::error::{NmtError, Result};
use crate::lang::LanguagePair;

/// Named, language-keyed collection of aligned line files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BilingualCorpus {
    name: String,
    folder: PathBuf,
    langs: Vec<String>,
}

impl BilingualCorpus {
    /// Describes a corpus `name` in `folder` covering `langs`. No file is touched.
    pub fn make_parallel<S: AsRef<str>>(
        name: impl Into<String>,
        folder: impl Into<PathBuf>,
        langs: &[S],
    ) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            langs: langs.iter().map(|lang| lang.as_ref().to_string()).collect(),
        }
    }

    /// Corpus name shared by all of its language files.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Languages for which a file exists (or will be written).
    #[must_use]
    pub fn langs(&self) -> &[String] {
        &self.langs
    }

    /// Folder holding the language files.
    #[must_use]
    pub fn get_folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the file holding `lang`.
    #[must_use]
    pub fn get_file(&self, lang: &str) -> PathBuf {
        self.folder.join(format!("{}.{lang}", self.name))
    }

    /// True when the corpus has a file for both languages of `pair`.
    #[must_use]
    pub fn covers(&self, pair: &LanguagePair) -> bool {
        pair.langs()
            .iter()
            .all(|lang| self.langs.iter().any(|have| have == lang))
    }

    /// Opens a single-pass reader over `(source, target)` lines.
    pub fn reader(&self, langs: [&str; 2]) -> Result<CorpusReader> {
        let source_path = self.get_file(langs[0]);
        let target_path = self.get_file(langs[1]);
        let source =
            File::open(&source_path).map_err(|err| NmtError::io_at(err, &source_path))?;
        let target =
            File::open(&target_path).map_err(|err| NmtError::io_at(err, &target_path))?;
        Ok(CorpusReader {
            source: BufReader::new(source),
            target: BufReader::new(target),
            source_path,
            target_path,
            source_buf: Vec::new(),
            target_buf: Vec::new(),
            line: 0,
            done: false,
        })
    }

    /// Creates (truncating) both language files and returns a pair sink.
    pub fn writer(&self, langs: [&str; 2]) -> Result<CorpusWriter> {
        fs::create_dir_all(&self.folder).map_err(|err| NmtError::io_at(err, &self.folder))?;
        let source_path = self.get_file(langs[0]);
        let target_path = self.get_file(langs[1]);
        let source =
            File::create(&source_path).map_err(|err| NmtError::io_at(err, &source_path))?;
        let target =
            File::create(&target_path).map_err(|err| NmtError::io_at(err, &target_path))?;
        Ok(CorpusWriter {
            source: BufWriter::new(source),
            target: BufWriter::new(target),
            source_path,
            target_path,
        })
    }

    /// Lists every corpus directly inside `folder`, sorted by name.
    pub fn list<P: AsRef<Path>>(folder: P) -> Result<Vec<Self>> {
        let folder = folder.as_ref();
        if !folder.is_dir() {
            return Err(NmtError::InvalidConfig(format!(
                "corpus folder {folder:?} does not exist"
            )));
        }
        let walker = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|err| NmtError::Internal(err.to_string()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(group_files(files))
    }

    /// Lists the corpora inside `folder` that have files for both languages of `pair`.
    pub fn list_parallel<P: AsRef<Path>>(folder: P, pair: &LanguagePair) -> Result<Vec<Self>> {
        Ok(Self::list(folder)?
            .into_iter()
            .filter(|corpus| corpus.covers(pair))
            .collect())
    }

    /// Discovers parallel corpora under several roots, descending into sub-directories.
    ///
    /// Roots may also point at a single language file, in which case its sibling for the other
    /// language is expected next to it.
    pub fn collect<P: AsRef<Path>>(roots: &[P], pair: &LanguagePair) -> Result<Vec<Self>> {
        let mut files = Vec::new();
        for root in roots {
            let root = root.as_ref();
            if !root.exists() {
                return Err(NmtError::InvalidConfig(format!(
                    "input path {root:?} does not exist"
                )));
            }
            if root.is_file() {
                files.push(root.to_path_buf());
                if let Some(stem) = root.file_stem() {
                    for lang in pair.langs() {
                        let sibling = root.with_file_name(format!(
                            "{}.{lang}",
                            stem.to_string_lossy()
                        ));
                        if sibling.is_file() && sibling != root {
                            files.push(sibling);
                        }
                    }
                }
                continue;
            }
            for entry in WalkDir::new(root).sort_by_file_name() {
                let entry = entry.map_err(|err| NmtError::Internal(err.to_string()))?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        }
        let corpora: Vec<Self> = group_files(files)
            .into_iter()
            .filter(|corpus| corpus.covers(pair))
            .collect();
        if corpora.is_empty() {
            return Err(NmtError::InvalidConfig(format!(
                "no {pair} corpora discovered in provided inputs"
            )));
        }
        Ok(corpora)
    }
}

fn group_files(files: Vec<PathBuf>) -> Vec<BilingualCorpus> {
    let mut groups: BTreeMap<(PathBuf, String), Vec<String>> = BTreeMap::new();
    for path in files {
        let Some(file_name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let Some((name, lang)) = file_name.rsplit_once('.') else {
            continue;
        };
        if name.is_empty() || lang.is_empty() {
            continue;
        }
        let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let langs = groups.entry((folder, name.to_string())).or_default();
        if !langs.iter().any(|have| have == lang) {
            langs.push(lang.to_string());
        }
    }
    groups
        .into_iter()
        .map(|((folder, name), mut langs)| {
            langs.sort();
            BilingualCorpus {
                name,
                folder,
                langs,
            }
        })
        .collect()
}

/// Streaming iterator over aligned `(source, target)` lines.
///
/// Invalid UTF-8 is replaced rather than reported. Both file handles are released when the
/// reader is dropped.
#[derive(Debug)]
pub struct CorpusReader {
    source: BufReader<File>,
    target: BufReader<File>,
    source_path: PathBuf,
    target_path: PathBuf,
    source_buf: Vec<u8>,
    target_buf: Vec<u8>,
    line: usize,
    done: bool,
}

fn read_line(reader: &mut BufReader<File>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

impl Iterator for CorpusReader {
    type Item = Result<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let source = match read_line(&mut self.source, &mut self.source_buf) {
            Ok(line) => line,
            Err(err) => {
                self.done = true;
                return Some(Err(NmtError::io_at(err, &self.source_path)));
            }
        };
        let target = match read_line(&mut self.target, &mut self.target_buf) {
            Ok(line) => line,
            Err(err) => {
                self.done = true;
                return Some(Err(NmtError::io_at(err, &self.target_path)));
            }
        };
        match (source, target) {
            (Some(source), Some(target)) => {
                self.line += 1;
                Some(Ok((source, target)))
            }
            (None, None) => {
                self.done = true;
                None
            }
            _ => {
                warn!(
                    "{:?} and {:?} are misaligned after {} lines; ignoring the remainder",
                    self.source_path, self.target_path, self.line
                );
                self.done = true;
                None
            }
        }
    }
}

/// Sink writing aligned pairs to the two language files of a corpus.
#[derive(Debug)]
pub struct CorpusWriter {
    source: BufWriter<File>,
    target: BufWriter<File>,
    source_path: PathBuf,
    target_path: PathBuf,
}

impl CorpusWriter {
    /// Appends one pair, one line per side.
    pub fn write_pair(&mut self, source: &str, target: &str) -> Result<()> {
        writeln!(self.source, "{source}").map_err(|err| NmtError::io_at(err, &self.source_path))?;
        writeln!(self.target, "{target}").map_err(|err| NmtError::io_at(err, &self.target_path))?;
        Ok(())
    }

    /// Flushes both files, surfacing any deferred write error.
    pub fn finish(mut self) -> Result<()> {
        self.source
            .flush()
            .map_err(|err| NmtError::io_at(err, &self.source_path))?;
        self.target
            .flush()
            .map_err(|err| NmtError::io_at(err, &self.target_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pair() -> LanguagePair {
        LanguagePair::new("en", "it")
    }

    #[test]
    fn writer_then_reader_preserves_pairs() {
        let dir = tempdir().expect("tempdir");
        let corpus = BilingualCorpus::make_parallel("news", dir.path(), &["en", "it"]);
        let mut writer = corpus.writer(pair().langs()).expect("writer");
        writer.write_pair("hello world", "ciao mondo").expect("write");
        writer.write_pair("good night", "buona notte").expect("write");
        writer.finish().expect("finish");

        let pairs: Vec<_> = corpus
            .reader(pair().langs())
            .expect("reader")
            .collect::<Result<_>>()
            .expect("read pairs");
        assert_eq!(
            pairs,
            vec![
                ("hello world".to_string(), "ciao mondo".to_string()),
                ("good night".to_string(), "buona notte".to_string()),
            ]
        );
    }

    #[test]
    fn reader_strips_crlf_and_stops_at_shorter_side() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("c.en"), "a\r\nb\r\nc\r\n").expect("write en");
        fs::write(dir.path().join("c.it"), "x\ny\n").expect("write it");
        let corpus = BilingualCorpus::make_parallel("c", dir.path(), &["en", "it"]);
        let pairs: Vec<_> = corpus
            .reader(pair().langs())
            .expect("reader")
            .collect::<Result<_>>()
            .expect("read pairs");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], ("b".to_string(), "y".to_string()));
    }

    #[test]
    fn list_groups_language_files() {
        let dir = tempdir().expect("tempdir");
        for file in ["b.en", "b.it", "a.en", "a.it", "mono.en", ".hidden"] {
            fs::write(dir.path().join(file), "line\n").expect("write file");
        }
        let all = BilingualCorpus::list(dir.path()).expect("list");
        let names: Vec<_> = all.iter().map(BilingualCorpus::name).collect();
        assert_eq!(names, vec!["a", "b", "mono"]);

        let parallel = BilingualCorpus::list_parallel(dir.path(), &pair()).expect("list");
        assert_eq!(parallel.len(), 2);
        assert_eq!(parallel[0].langs(), &["en".to_string(), "it".to_string()]);
    }

    #[test]
    fn collect_descends_into_nested_roots() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).expect("create nested");
        for file in ["x.en", "x.it"] {
            fs::write(dir.path().join(file), "l\n").expect("write root file");
            fs::write(nested.join(file), "l\n").expect("write nested file");
        }
        let corpora = BilingualCorpus::collect(&[dir.path()], &pair()).expect("collect");
        assert_eq!(corpora.len(), 2);
    }

    #[test]
    fn collect_rejects_missing_roots() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        assert!(matches!(
            BilingualCorpus::collect(&[missing], &pair()),
            Err(NmtError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reader_reports_missing_files() {
        let dir = tempdir().expect("tempdir");
        let corpus = BilingualCorpus::make_parallel("ghost", dir.path(), &["en", "it"]);
        assert!(matches!(
            corpus.reader(pair().langs()),
            Err(NmtError::Io { .. })
        ));
    }
}
