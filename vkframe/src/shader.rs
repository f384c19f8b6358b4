// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Compiling GLSL to SPIR-V with an external compiler.
//!
//! The compiler (`glslangValidator` by default) runs as a subprocess. Its outputs are kept in a
//! cache directory, one binary and one disassembly per (source file, entry point, stage), and are
//! only rebuilt when the source file is newer than the binary. The cached file names carry a
//! hash of the source's full path, so sources with the same name in different directories
//! don't share outputs.

use foldhash::fast::FixedState;
use std::{
    error::Error,
    ffi::OsString,
    fmt::{self, Display},
    fs,
    hash::BuildHasher,
    io,
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// A shader stage the compiler can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// The name of the stage on the compiler command line.
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }
}

/// The result of a successful compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledShader {
    pub spirv: Vec<u32>,
    pub binary_path: PathBuf,
    pub disassembly_path: PathBuf,
    /// Whether the compiler actually ran, as opposed to the binary being up to date.
    pub rebuilt: bool,
}

/// Runs the external shader compiler.
#[derive(Clone, Debug)]
pub struct ShaderCompiler {
    program: PathBuf,
    cache_dir: PathBuf,
}

impl ShaderCompiler {
    /// Creates a compiler that runs `program` and writes its outputs into `cache_dir`.
    #[inline]
    pub fn new(program: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        ShaderCompiler {
            program: program.into(),
            cache_dir: cache_dir.into(),
        }
    }

    #[inline]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns where the binary and the disassembly of a compilation are written.
    pub fn output_paths(
        &self,
        source: &Path,
        entry_point: &str,
        stage: ShaderStage,
    ) -> (PathBuf, PathBuf) {
        let stem = source
            .file_stem()
            .map_or_else(|| "shader".into(), |stem| stem.to_string_lossy());
        let full_path = fs::canonicalize(source)
            .or_else(|_| std::path::absolute(source))
            .unwrap_or_else(|_| source.to_owned());
        let path_hash = FixedState::with_seed(0).hash_one(&full_path);
        let base = format!(
            "{}.{:016x}.{}.{}",
            stem,
            path_hash,
            entry_point,
            stage.name(),
        );

        (
            self.cache_dir.join(format!("{}.spv", base)),
            self.cache_dir.join(format!("{}.spvasm", base)),
        )
    }

    /// Compiles `entry_point` of `source` for `stage`, unless the cached binary is up to date.
    ///
    /// A [`ShaderError::Compile`] carries the compiler's diagnostics; the caller may fix the
    /// source and call this again.
    pub fn compile(
        &self,
        source: &Path,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<CompiledShader, ShaderError> {
        let (binary_path, disassembly_path) = self.output_paths(source, entry_point, stage);

        let source_modified = modified(source)?.ok_or_else(|| ShaderError::Io {
            path: source.to_owned(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;
        let binary_modified = modified(&binary_path)?;
        let rebuilt = is_stale(source_modified, binary_modified);

        if rebuilt {
            self.run(source, entry_point, stage, &binary_path, &disassembly_path)?;
        } else {
            log::debug!("{} is up to date", binary_path.display());
        }

        let bytes = fs::read(&binary_path).map_err(|source| ShaderError::Io {
            path: binary_path.clone(),
            source,
        })?;
        let spirv = spirv_words(&bytes).ok_or_else(|| ShaderError::InvalidBinary {
            path: binary_path.clone(),
        })?;

        Ok(CompiledShader {
            spirv,
            binary_path,
            disassembly_path,
            rebuilt,
        })
    }

    fn run(
        &self,
        source: &Path,
        entry_point: &str,
        stage: ShaderStage,
        binary_path: &Path,
        disassembly_path: &Path,
    ) -> Result<(), ShaderError> {
        fs::create_dir_all(&self.cache_dir).map_err(|source| ShaderError::Io {
            path: self.cache_dir.clone(),
            source,
        })?;

        let mut args: Vec<OsString> =
            vec!["-V".into(), "-H".into(), "-S".into(), stage.name().into()];
        if entry_point != "main" {
            // The function named `entry_point` is the entry point, and keeps its name.
            args.extend(["-e".into(), entry_point.into()]);
            args.extend(["--source-entrypoint".into(), entry_point.into()]);
        }
        args.extend(["-o".into(), binary_path.into(), source.into()]);

        log::info!(
            "compiling {} ({}, {})",
            source.display(),
            entry_point,
            stage.name(),
        );
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| ShaderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            // A failed run must not leave a binary that looks up to date.
            let _ = fs::remove_file(binary_path);

            let mut diagnostics = String::from_utf8_lossy(&output.stdout).into_owned();
            diagnostics.push_str(&String::from_utf8_lossy(&output.stderr));

            return Err(ShaderError::Compile {
                path: source.to_owned(),
                entry_point: entry_point.to_owned(),
                diagnostics: diagnostics.trim().to_owned(),
            });
        }

        // With `-H` the compiler prints the disassembly on its standard output.
        fs::write(disassembly_path, &output.stdout).map_err(|source| ShaderError::Io {
            path: disassembly_path.to_owned(),
            source,
        })
    }
}

/// Returns whether a binary has to be rebuilt from its source.
#[inline]
pub fn is_stale(source_modified: SystemTime, binary_modified: Option<SystemTime>) -> bool {
    binary_modified.map_or(true, |binary_modified| source_modified > binary_modified)
}

fn modified(path: &Path) -> Result<Option<SystemTime>, ShaderError> {
    match fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => Ok(Some(modified)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ShaderError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Reinterprets a SPIR-V binary as words, checking its magic number.
pub fn spirv_words(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.len() % 4 != 0 || bytes.len() < 4 {
        return None;
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();

    (words[0] == SPIRV_MAGIC).then_some(words)
}

/// Error that can happen when compiling a shader.
#[derive(Debug)]
pub enum ShaderError {
    /// The compiler could not be started.
    Spawn { program: PathBuf, source: io::Error },

    /// Reading the source or writing an output failed.
    Io { path: PathBuf, source: io::Error },

    /// The compiler rejected the source.
    Compile {
        path: PathBuf,
        entry_point: String,
        diagnostics: String,
    },

    /// The compiler produced something that is not SPIR-V.
    InvalidBinary { path: PathBuf },
}

impl ShaderError {
    /// Returns whether retrying after fixing the source can succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShaderError::Compile { .. })
    }
}

impl Error for ShaderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } | Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Display for ShaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, .. } => {
                write!(f, "failed to run the shader compiler `{}`", program.display())
            }
            Self::Io { path, .. } => write!(f, "I/O error on `{}`", path.display()),
            Self::Compile {
                path,
                entry_point,
                diagnostics,
            } => write!(
                f,
                "failed to compile `{}` (entry point `{}`):\n{}",
                path.display(),
                entry_point,
                diagnostics,
            ),
            Self::InvalidBinary { path } => {
                write!(f, "`{}` is not a SPIR-V binary", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vkframe-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn staleness() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(10);

        assert!(is_stale(now, None));
        assert!(is_stale(now, Some(earlier)));
        assert!(!is_stale(earlier, Some(now)));
        assert!(!is_stale(now, Some(now)));
    }

    #[test]
    fn outputs_keyed_by_source_entry_and_stage() {
        let compiler = ShaderCompiler::new("glslangValidator", "/cache");
        let source = Path::new("shaders/mesh.glsl");
        let (binary, disassembly) = compiler.output_paths(source, "main", ShaderStage::Vertex);

        let name = binary.file_name().unwrap().to_str().unwrap();
        assert!(binary.starts_with("/cache"));
        assert!(name.starts_with("mesh.") && name.ends_with(".main.vert.spv"));
        assert_eq!(disassembly, binary.with_extension("spvasm"));

        // Stable for a given source.
        assert_eq!(
            compiler.output_paths(source, "main", ShaderStage::Vertex).0,
            binary,
        );
        for other in [
            compiler.output_paths(source, "main", ShaderStage::Fragment).0,
            compiler.output_paths(source, "shade", ShaderStage::Vertex).0,
            compiler
                .output_paths(Path::new("other/mesh.glsl"), "main", ShaderStage::Vertex)
                .0,
        ] {
            assert_ne!(other, binary);
        }
    }

    #[test]
    fn spirv_magic() {
        assert_eq!(
            spirv_words(&[0x03, 0x02, 0x23, 0x07, 1, 0, 0, 0]),
            Some(vec![SPIRV_MAGIC, 1]),
        );
        assert_eq!(spirv_words(&[0x03, 0x02, 0x23]), None);
        assert_eq!(spirv_words(&[0, 0, 0, 0]), None);
    }

    #[test]
    fn missing_compiler() {
        let dir = scratch_dir("missing-compiler");
        let source = dir.join("a.glsl");
        fs::write(&source, "void main() {}").unwrap();

        let compiler = ShaderCompiler::new(dir.join("no-such-compiler"), dir.join("cache"));
        let err = compiler
            .compile(&source, "main", ShaderStage::Vertex)
            .unwrap_err();

        assert!(matches!(err, ShaderError::Spawn { .. }));
        assert!(!err.is_recoverable());
    }

    #[cfg(unix)]
    fn fake_compiler(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-compiler");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn compiles_once_then_uses_the_cache() {
        let dir = scratch_dir("cache");
        let source = dir.join("mesh.glsl");
        fs::write(&source, "void main() {}").unwrap();
        let program = fake_compiler(
            &dir,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
             if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n\
             shift\n\
             done\n\
             printf '\\003\\002\\043\\007' > \"$out\"\n\
             echo '; SPIR-V'\n",
        );

        // Make sure the source is strictly older than the binary about to be written.
        let past = SystemTime::now() - Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let compiler = ShaderCompiler::new(program, dir.join("cache"));
        let first = compiler
            .compile(&source, "main", ShaderStage::Fragment)
            .unwrap();
        assert!(first.rebuilt);
        assert_eq!(first.spirv, vec![SPIRV_MAGIC]);
        assert_eq!(
            fs::read_to_string(&first.disassembly_path).unwrap().trim(),
            "; SPIR-V",
        );

        let second = compiler
            .compile(&source, "main", ShaderStage::Fragment)
            .unwrap();
        assert!(!second.rebuilt);
        assert_eq!(second.spirv, first.spirv);
    }

    #[cfg(unix)]
    fn set_in_the_past(path: &Path) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn same_file_name_in_different_directories() {
        let dir = scratch_dir("same-name");
        // Outputs the magic number followed by the first word of the source.
        let program = fake_compiler(
            &dir,
            "#!/bin/sh\n\
             while [ $# -gt 0 ]; do\n\
             if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n\
             src=\"$1\"\n\
             shift\n\
             done\n\
             printf '\\003\\002\\043\\007' > \"$out\"\n\
             head -c 4 \"$src\" >> \"$out\"\n",
        );

        let sources = [("a", b"AAAA"), ("b", b"BBBB")].map(|(subdir, contents)| {
            fs::create_dir_all(dir.join(subdir)).unwrap();
            let source = dir.join(subdir).join("mesh.vert");
            fs::write(&source, contents).unwrap();
            set_in_the_past(&source);
            source
        });

        let compiler = ShaderCompiler::new(program, dir.join("cache"));
        let b = compiler
            .compile(&sources[1], "main", ShaderStage::Vertex)
            .unwrap();
        let a = compiler
            .compile(&sources[0], "main", ShaderStage::Vertex)
            .unwrap();

        assert!(a.rebuilt && b.rebuilt);
        assert_ne!(a.binary_path, b.binary_path);
        assert_eq!(a.spirv, vec![SPIRV_MAGIC, u32::from_le_bytes(*b"AAAA")]);
        assert_eq!(b.spirv, vec![SPIRV_MAGIC, u32::from_le_bytes(*b"BBBB")]);
    }

    #[cfg(unix)]
    #[test]
    fn named_entry_point_is_compiled_from_the_source() {
        let dir = scratch_dir("entry-point");
        let source = dir.join("effects.glsl");
        fs::write(&source, "void shade() {}").unwrap();
        set_in_the_past(&source);
        // Writes its arguments next to the binary.
        let program = fake_compiler(
            &dir,
            "#!/bin/sh\n\
             args=\"$*\"\n\
             while [ $# -gt 0 ]; do\n\
             if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n\
             shift\n\
             done\n\
             printf '\\003\\002\\043\\007' > \"$out\"\n\
             echo \"$args\" > \"$out.args\"\n",
        );

        let compiler = ShaderCompiler::new(program, dir.join("cache"));
        let compiled = compiler
            .compile(&source, "shade", ShaderStage::Compute)
            .unwrap();

        let mut args_path = compiled.binary_path.into_os_string();
        args_path.push(".args");
        let args = fs::read_to_string(args_path).unwrap();
        assert!(args.contains("-e shade --source-entrypoint shade"));
    }

    #[cfg(unix)]
    #[test]
    fn diagnostics_are_surfaced() {
        let dir = scratch_dir("diagnostics");
        let source = dir.join("broken.glsl");
        fs::write(&source, "void main() {").unwrap();
        let program = fake_compiler(
            &dir,
            "#!/bin/sh\necho 'ERROR: broken.glsl:1: unexpected end of file'\nexit 2\n",
        );

        let compiler = ShaderCompiler::new(program, dir.join("cache"));
        let err = compiler
            .compile(&source, "main", ShaderStage::Vertex)
            .unwrap_err();

        assert!(err.is_recoverable());
        match err {
            ShaderError::Compile {
                entry_point,
                diagnostics,
                ..
            } => {
                assert_eq!(entry_point, "main");
                assert!(diagnostics.contains("unexpected end of file"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
