use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRequest {
    /// Open a folder of slices in the viewer.
    Folder(PathBuf),
    /// Show an ordinary picture in the viewer.
    Picture(PathBuf),
    /// Run the mask pipeline once without a window.
    Predict {
        input: PathBuf,
        output_dir: PathBuf,
        truth: Option<PathBuf>,
    },
}

pub const USAGE: &str = "usage: lungview [--open] FOLDER | --image FILE | --predict FILE [--out DIR] [--truth PNG]";

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    let request = match args[0].as_str() {
        "--open" => LaunchRequest::Folder(single_path(&args[1..], "--open", "folder")?),
        "--image" => LaunchRequest::Picture(single_path(&args[1..], "--image", "image")?),
        "--predict" => parse_predict(&args[1..])?,
        flag if flag.starts_with("--") => return Err(format!("Unknown option {flag}.")),
        _ => LaunchRequest::Folder(single_path(args, "", "folder")?),
    };
    Ok(Some(request))
}

fn single_path(rest: &[String], flag: &str, what: &str) -> Result<PathBuf, String> {
    match rest {
        [] => Err(format!("Missing {what} path after {flag}.")),
        [path] => Ok(PathBuf::from(path)),
        _ => Err(format!("Expected a single {what} path, got {}.", rest.len())),
    }
}

fn parse_predict(rest: &[String]) -> Result<LaunchRequest, String> {
    let mut input = None::<PathBuf>;
    let mut output_dir = None::<PathBuf>;
    let mut truth = None::<PathBuf>;

    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        let slot = match arg.as_str() {
            "--out" => &mut output_dir,
            "--truth" => &mut truth,
            flag if flag.starts_with("--") => {
                return Err(format!("Unknown option {flag} for --predict."));
            }
            path => {
                if input.is_some() {
                    return Err(format!("Unexpected extra argument {path}."));
                }
                input = Some(PathBuf::from(path));
                continue;
            }
        };
        let value = iter
            .next()
            .ok_or_else(|| format!("Missing value after {arg}."))?;
        *slot = Some(PathBuf::from(value));
    }

    let input = input.ok_or_else(|| "Missing DICOM file after --predict.".to_string())?;
    Ok(LaunchRequest::Predict {
        input,
        output_dir: output_dir.unwrap_or_else(|| PathBuf::from(".")),
        truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn no_args_opens_empty_viewer() {
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }

    #[test]
    fn bare_path_and_open_flag_pick_a_folder() {
        let expected = Some(LaunchRequest::Folder(PathBuf::from("scans/patient-01")));
        assert_eq!(
            parse_launch_request_from_args(&args(&["scans/patient-01"])),
            Ok(expected.clone())
        );
        assert_eq!(
            parse_launch_request_from_args(&args(&["--open", "scans/patient-01"])),
            Ok(expected)
        );
    }

    #[test]
    fn image_flag_opens_picture() {
        assert_eq!(
            parse_launch_request_from_args(&args(&["--image", "chest.png"])),
            Ok(Some(LaunchRequest::Picture(PathBuf::from("chest.png"))))
        );
    }

    #[test]
    fn predict_with_options_in_any_order() {
        let request = parse_launch_request_from_args(&args(&[
            "--predict",
            "--truth",
            "ref/slice-07.png",
            "scans/slice-07.dcm",
            "--out",
            "out",
        ]))
        .expect("arguments should parse");
        assert_eq!(
            request,
            Some(LaunchRequest::Predict {
                input: PathBuf::from("scans/slice-07.dcm"),
                output_dir: PathBuf::from("out"),
                truth: Some(PathBuf::from("ref/slice-07.png")),
            })
        );
    }

    #[test]
    fn predict_defaults_to_current_directory() {
        let request = parse_launch_request_from_args(&args(&["--predict", "a.dcm"]))
            .expect("arguments should parse");
        assert_eq!(
            request,
            Some(LaunchRequest::Predict {
                input: PathBuf::from("a.dcm"),
                output_dir: PathBuf::from("."),
                truth: None,
            })
        );
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(parse_launch_request_from_args(&args(&["--open"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--image", "a.png", "b.png"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--predict"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--predict", "a.dcm", "--out"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--predict", "a.dcm", "b.dcm"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--zoom", "2"])).is_err());
    }
}
