mod tile;

pub use tile::{
    flat_reader_range, read_flat_file, read_header, read_tile, read_tiled_dir, tile_file_name,
    write_flat_file, write_header, write_tile, write_tiled_dir, FlatFile, Tile, TileHeader,
    TiledArray, HEADER_FILE_NAME,
};
